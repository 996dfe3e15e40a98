// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! RTSP拉流输入 (CPU软件解码)
//!
//! 每次连接启动一个解码线程运行 FFmpeg 解码图, 解码后的帧通过有界队列交给 `read`.
//! `read` 带超时, 超时/流结束/解码失败都作为读取错误交给连接监督重连.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use image::RgbImage;
use tracing::{error, info, warn};

use super::decode_filter::DecodeFilter;
use super::FrameSource;
use crate::error::SourceError;

/// 等待解码线程退出的最长时间
const JOIN_GRACE: Duration = Duration::from_millis(500);

struct Session {
    frames: Receiver<RgbImage>,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
    /// 连接时收到的首帧
    pending: Option<RgbImage>,
}

pub struct RtspSource {
    address: String,
    read_timeout: Duration,
    queue_capacity: usize,
    session: Option<Session>,
    /// 已通知退出但仍阻塞在网络读取上的解码线程
    stale: Vec<JoinHandle<()>>,
}

impl RtspSource {
    pub fn new(address: String, read_timeout: Duration, queue_capacity: usize) -> Self {
        Self {
            address,
            read_timeout,
            queue_capacity: queue_capacity.max(1),
            session: None,
            stale: Vec::new(),
        }
    }

    /// 回收已通知退出的解码线程: 宽限期内结束则 join, 否则留待之后回收
    fn retire(&mut self, worker: JoinHandle<()>) {
        let deadline = Instant::now() + JOIN_GRACE;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if worker.is_finished() {
            if worker.join().is_err() {
                warn!("❌ 解码线程异常退出: {}", self.address);
            }
        } else {
            warn!("⏳ 解码线程仍在退出: {}", self.address);
            self.stale.push(worker);
        }
    }

    fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.stale.drain(..).partition(|w| w.is_finished());
        for worker in done {
            let _ = worker.join();
        }
        self.stale = pending;
    }

    fn read_error(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Read {
            address: self.address.clone(),
            reason: reason.into(),
        }
    }
}

impl FrameSource for RtspSource {
    fn address(&self) -> &str {
        &self.address
    }

    /// 启动解码线程并等待首帧
    fn connect(&mut self) -> Result<(), SourceError> {
        self.disconnect();
        self.reap();

        let (tx, rx) = bounded(self.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let filter = DecodeFilter::new(self.address.clone(), tx, stop.clone());
        let url = self.address.clone();
        let worker = std::thread::Builder::new()
            .name("rtsp-decode".to_string())
            .spawn(move || {
                if let Err(e) = software_decode(&url, filter) {
                    error!("❌ 解码失败 {}: {}", url, e);
                }
            })
            .map_err(|e| SourceError::Connect {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        // 解码线程退出时发送端随过滤器一起释放
        match rx.recv_timeout(self.read_timeout) {
            Ok(first) => {
                info!("✅ RTSP 已连接: {} ({}x{})", self.address, first.width(), first.height());
                self.session = Some(Session {
                    frames: rx,
                    stop,
                    worker,
                    pending: Some(first),
                });
                Ok(())
            }
            Err(e) => {
                // 释放接收端后过滤器下一帧即返回错误, 解码图随之结束
                stop.store(true, Ordering::Relaxed);
                drop(rx);
                self.retire(worker);
                Err(SourceError::Connect {
                    address: self.address.clone(),
                    reason: match e {
                        RecvTimeoutError::Timeout => {
                            format!("no frame within {}ms", self.read_timeout.as_millis())
                        }
                        RecvTimeoutError::Disconnected => "decoder exited".to_string(),
                    },
                })
            }
        }
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let timeout = self.read_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(SourceError::NotConnected {
                address: self.address.clone(),
            });
        };
        if let Some(first) = session.pending.take() {
            return Ok(Some(first));
        }
        match session.frames.recv_timeout(timeout) {
            Ok(image) => Ok(Some(image)),
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Timeout {
                address: self.address.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            // 实时流不会正常结束, 解码线程退出按断流处理
            Err(RecvTimeoutError::Disconnected) => Err(self.read_error("stream ended")),
        }
    }

    /// 通知解码线程退出并在宽限期内等待; 阻塞在网络读取上的线程留到下次连接时回收
    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop.store(true, Ordering::Relaxed);
            drop(session.frames);
            self.retire(session.worker);
            warn!("🔌 RTSP 断开: {}", self.address);
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn software_decode(url: &str, filter: DecodeFilter) -> Result<(), String> {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let input = Input::new(url).set_input_opts(
        [
            ("rtsp_transport", "tcp"),
            ("buffer_size", "67108864"),
            ("rtsp_flags", "prefer_tcp"),
        ]
        .into(),
    );

    let ctx = FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=yuv420p"].into())
        .output(out)
        .build()
        .map_err(|e| format!("构建失败: {}", e))?;

    let sch = ctx.start().map_err(|e| format!("启动失败: {}", e))?;
    sch.wait().map_err(|e| format!("解码中断: {}", e))
}
