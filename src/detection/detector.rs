// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测器服务 (Detector service)
//! 职责: 独占外部检测/跟踪模型 → 串行处理各摄像头的批量请求 → 回传每帧检测结果
//!
//! 模型执行上下文通常不允许并发调用, 因此所有摄像头通过同一个请求队列访问它,
//! 而不是每次调用加锁. 每个请求保持摄像头自身的批次大小.

use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use super::types::{Detection, FrameRef};
use crate::config::DetectorConfig;
use crate::error::DetectError;

/// 外部检测 + 跟踪边界
///
/// 给定同一摄像头的一批帧, 返回每帧的检测结果. 跟踪ID由实现方分配,
/// 跟踪状态必须按 `camera_id` 隔离.
pub trait Detector: Send {
    fn detect(&mut self, camera_id: u32, frames: &[FrameRef]) -> anyhow::Result<Vec<Vec<Detection>>>;

    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, camera_id: u32, frames: &[FrameRef]) -> anyhow::Result<Vec<Vec<Detection>>> {
        (**self).detect(camera_id, frames)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// 检测请求 (处理线程 → 检测线程)
struct DetectRequest {
    camera_id: u32,
    frames: Vec<FrameRef>,
    reply: Sender<Result<Vec<Vec<Detection>>, DetectError>>,
}

/// 检测器句柄, 可在多个摄像头之间克隆共享
#[derive(Clone)]
pub struct DetectorHandle {
    tx: Sender<DetectRequest>,
    batch_size: usize,
}

impl DetectorHandle {
    /// 提交一批帧并阻塞等待结果
    pub fn detect(
        &self,
        camera_id: u32,
        frames: Vec<FrameRef>,
    ) -> Result<Vec<Vec<Detection>>, DetectError> {
        let expected = frames.len();
        let (reply, rx) = bounded(1);
        self.tx
            .send(DetectRequest {
                camera_id,
                frames,
                reply,
            })
            .map_err(|_| DetectError::ServiceStopped)?;

        let results = rx.recv().map_err(|_| DetectError::ServiceStopped)??;
        if results.len() != expected {
            return Err(DetectError::BatchMismatch {
                expected,
                got: results.len(),
            });
        }
        Ok(results)
    }

    /// 每次调用建议的最大帧数
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// 检测器服务: 单线程独占模型
pub struct DetectorService {
    handle: DetectorHandle,
    worker: JoinHandle<()>,
}

impl DetectorService {
    /// 启动检测线程
    pub fn spawn<D: Detector + 'static>(detector: D, config: &DetectorConfig) -> std::io::Result<Self> {
        let batch_size = config.effective_batch_size();
        let (tx, rx) = bounded::<DetectRequest>(config.request_queue.max(1));

        info!(
            "🔍 检测服务启动: {} | 设备 {} | 批次 {} | 输入尺寸 {}",
            detector.name(),
            config.device,
            batch_size,
            config.inference_size
        );

        let worker = std::thread::Builder::new()
            .name("detector".to_string())
            .spawn(move || run_detector(detector, rx))?;

        Ok(Self {
            handle: DetectorHandle { tx, batch_size },
            worker,
        })
    }

    pub fn handle(&self) -> DetectorHandle {
        self.handle.clone()
    }

    /// 关闭服务: 丢弃自身句柄, 等待所有克隆句柄释放后线程退出
    pub fn shutdown(self) {
        drop(self.handle);
        if self.worker.join().is_err() {
            warn!("❌ 检测线程异常退出");
        }
    }
}

fn run_detector<D: Detector>(mut detector: D, rx: Receiver<DetectRequest>) {
    let mut count = 0u64;
    let mut last = Instant::now();

    // 所有句柄释放后 recv 返回 Err, 线程退出
    while let Ok(request) = rx.recv() {
        let started = Instant::now();
        let result = detector
            .detect(request.camera_id, &request.frames)
            .map_err(|e| DetectError::Backend(format!("{:#}", e)));
        count += request.frames.len() as u64;

        debug!(
            camera = request.camera_id,
            frames = request.frames.len(),
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "检测批次完成"
        );
        // 调用方可能已退出, 忽略发送失败
        let _ = request.reply.send(result);

        if last.elapsed().as_secs_f64() >= 1.0 {
            let fps = count as f64 / last.elapsed().as_secs_f64();
            debug!("📊 检测吞吐: {:.1} 帧/秒", fps);
            count = 0;
            last = Instant::now();
        }
    }
    info!("🛑 检测服务退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, Frame};
    use image::RgbImage;

    /// 每帧返回一个检测, 跟踪ID = 摄像头ID * 100 + 帧序号
    struct EchoDetector;

    impl Detector for EchoDetector {
        fn detect(&mut self, camera_id: u32, frames: &[FrameRef]) -> anyhow::Result<Vec<Vec<Detection>>> {
            Ok(frames
                .iter()
                .map(|f| {
                    vec![Detection::new(f.clone(), BBox::new(1.0, 1.0, 4.0, 4.0), 0.9)
                        .with_track(camera_id as u64 * 100 + f.seq)]
                })
                .collect())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&mut self, _: u32, _: &[FrameRef]) -> anyhow::Result<Vec<Vec<Detection>>> {
            anyhow::bail!("model not loaded")
        }
    }

    fn frames(n: u64) -> Vec<FrameRef> {
        (0..n).map(|i| Frame::shared(i, RgbImage::new(8, 8))).collect()
    }

    #[test]
    fn serves_multiple_handles() {
        let service = DetectorService::spawn(EchoDetector, &DetectorConfig::default()).unwrap();
        let a = service.handle();
        let b = service.handle();

        let ra = std::thread::spawn(move || a.detect(1, frames(3)).unwrap());
        let rb = b.detect(2, frames(2)).unwrap();
        let ra = ra.join().unwrap();

        assert_eq!(ra.len(), 3);
        assert_eq!(ra[2][0].track_id, Some(102));
        assert_eq!(rb.len(), 2);
        assert_eq!(rb[1][0].track_id, Some(201));
        drop(b);
        service.shutdown();
    }

    #[test]
    fn backend_errors_are_reported() {
        let service = DetectorService::spawn(FailingDetector, &DetectorConfig::default()).unwrap();
        let err = service.handle().detect(1, frames(1)).unwrap_err();
        assert!(matches!(err, DetectError::Backend(ref m) if m.contains("model not loaded")));
        service.shutdown();
    }
}
