// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 摄像头处理单元 (CameraProcessor)
//!
//! 组合 ConnectionSupervisor + CapturePipeline + TrackRegistry + WorkerPool + BestFrameSelector,
//! 每个摄像头一个实例, 运行在独立线程中, 不与其他摄像头共享可变状态.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use super::capture::{CaptureCounters, CapturePipeline, ExecutionMode, FrameHandler, SessionEnd};
use super::connection::{ConnectOutcome, ConnectionStatus, ConnectionSupervisor};
use super::shutdown::ShutdownSignal;
use crate::config::{AppConfig, CameraConfig};
use crate::detection::{Detection, DetectorHandle, FrameRef};
use crate::error::CameraError;
use crate::input::FrameSource;
use crate::output::{BestFrameSelector, BestShot, OutputSink};
use crate::pool::WorkerPool;
use crate::quality::{QualityBreakdown, QualityScorer};
use crate::track::{FinishedTrack, ScoredSample, TrackRegistry};

/// 每个摄像头的运行统计
#[derive(Clone, Debug, Default)]
pub struct ProcessingStats {
    pub frames_processed: u64,
    pub detect_failures: u64,
    pub detections_scored: u64,
    pub scoring_failures: u64,
    pub tracks_finalized: u64,
    pub selection_failures: u64,
    pub artifacts_written: u64,
    pub persist_failures: u64,
}

/// 摄像头处理单元结束时的报告
#[derive(Clone, Debug)]
pub struct CameraReport {
    pub camera_id: u32,
    pub camera_name: String,
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub frames_abandoned: u64,
    pub stats: ProcessingStats,
    pub final_status: ConnectionStatus,
}

/// 处理阶段: 检测 → 评分 → 注册表更新 → 选帧 → 输出
pub struct FrameProcessor {
    camera: CameraConfig,
    detector: DetectorHandle,
    registry: TrackRegistry,
    scorer: QualityScorer,
    pool: WorkerPool,
    selector: BestFrameSelector,
    sink: Arc<dyn OutputSink>,
    bulk_scoring: bool,
    counters: Arc<CaptureCounters>,
    stats: ProcessingStats,
    last_log: Instant,
    frames_since_log: u64,
}

impl FrameProcessor {
    pub fn new(
        camera: CameraConfig,
        config: &AppConfig,
        detector: DetectorHandle,
        pool: WorkerPool,
        selector: BestFrameSelector,
        sink: Arc<dyn OutputSink>,
        counters: Arc<CaptureCounters>,
    ) -> Self {
        Self {
            camera,
            detector,
            registry: TrackRegistry::new(config.tracking.clone()),
            scorer: QualityScorer::new(config.scoring.clone()),
            pool,
            selector,
            sink,
            bulk_scoring: config.pipeline.bulk_scoring,
            counters,
            stats: ProcessingStats::default(),
            last_log: Instant::now(),
            frames_since_log: 0,
        }
    }

    pub fn stats(&self) -> &ProcessingStats {
        &self.stats
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    /// 关闭: 所有活跃轨迹强制结束并输出
    pub fn finish(&mut self) {
        let finished = self.registry.finish_all();
        if !finished.is_empty() {
            info!("🏁 关闭时结束 {} 条活跃轨迹", finished.len());
        }
        self.emit(finished);
    }

    fn process_frame(&mut self, seq: u64, detections: Vec<Detection>) {
        // 没有跟踪ID的检测不参与缓存
        let associated: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.track_id.is_some())
            .collect();
        let samples = self.score(associated);
        self.stats.frames_processed += 1;
        self.stats.detections_scored += samples.len() as u64;

        let finished = self.registry.update(seq, samples);
        self.emit(finished);
    }

    /// 评分: 优先整批向量化, 失败时逐个并行评分; 单个失败的样本记为最低分
    fn score(&mut self, detections: Vec<Detection>) -> Vec<ScoredSample> {
        let scorer = &self.scorer;
        score_with(
            &self.pool,
            self.bulk_scoring,
            &mut self.stats,
            detections,
            |ds| scorer.breakdown_batch(ds),
            |d| scorer.breakdown(d),
        )
    }

    /// 已结束的轨迹并行选帧和标注, 然后依次输出
    fn emit(&mut self, finished: Vec<FinishedTrack>) {
        if finished.is_empty() {
            return;
        }
        self.stats.tracks_finalized += finished.len() as u64;

        let selector = &self.selector;
        let results = self
            .pool
            .submit(finished, |track| Ok(selector.finalize(track)?));

        for result in results {
            match result {
                Ok(shot) => self.persist(&shot),
                Err(e) => {
                    error!("❌ 选帧失败: {}", e);
                    self.stats.selection_failures += 1;
                }
            }
        }
    }

    fn persist(&mut self, shot: &BestShot) {
        match self.sink.persist(&self.camera, shot) {
            Ok(path) => {
                self.stats.artifacts_written += 1;
                info!(
                    "💾 轨迹 {} 最佳帧 #{} 得分 {:.3} ({} 样本, {}, {}) → {}",
                    shot.track_id,
                    shot.frame_seq,
                    shot.score,
                    shot.summary.samples,
                    if shot.moving { "移动" } else { "静止" },
                    shot.reason.as_str(),
                    path.display()
                );
            }
            Err(e) => {
                // 写入失败不影响处理, 轨迹仍视为已结束
                self.stats.persist_failures += 1;
                error!("❌ 轨迹 {} 输出失败: {}", shot.track_id, e);
            }
        }
    }

    fn log_throughput(&mut self, frames: u64) {
        self.frames_since_log += frames;
        let elapsed = self.last_log.elapsed();
        if elapsed < Duration::from_secs(1) {
            return;
        }
        let fps = self.frames_since_log as f64 / elapsed.as_secs_f64();
        info!(
            "📊 {:.1} fps | 跳过 {} | 活跃轨迹 {} | 已输出 {}",
            fps,
            self.counters.skipped(),
            self.registry.len(),
            self.stats.artifacts_written
        );
        self.frames_since_log = 0;
        self.last_log = Instant::now();
    }
}

fn score_with<B, S>(
    pool: &WorkerPool,
    bulk: bool,
    stats: &mut ProcessingStats,
    detections: Vec<Detection>,
    batch: B,
    single: S,
) -> Vec<ScoredSample>
where
    B: Fn(&[Detection]) -> Vec<QualityBreakdown> + Sync,
    S: Fn(&Detection) -> QualityBreakdown + Sync,
{
    if detections.is_empty() {
        return Vec::new();
    }

    if bulk {
        match pool.run(|| batch(&detections)) {
            Ok(breakdowns) if breakdowns.len() == detections.len() => {
                return detections
                    .into_iter()
                    .zip(breakdowns.iter())
                    .map(|(d, b)| ScoredSample::from_breakdown(d, b))
                    .collect();
            }
            Ok(breakdowns) => warn!(
                "⚠️ 批量评分数量不符 ({} / {}), 改为逐个评分",
                breakdowns.len(),
                detections.len()
            ),
            Err(e) => warn!("⚠️ 批量评分失败, 改为逐个评分: {}", e),
        }
    }

    let indices: Vec<usize> = (0..detections.len()).collect();
    let results = pool.submit(indices, |i| Ok(single(&detections[i])));

    let mut samples = Vec::with_capacity(detections.len());
    for (detection, result) in detections.into_iter().zip(results) {
        match result {
            Ok(breakdown) => samples.push(ScoredSample::from_breakdown(detection, &breakdown)),
            Err(e) => {
                warn!("⚠️ 样本评分失败 (track {:?}): {}", detection.track_id, e);
                stats.scoring_failures += 1;
                samples.push(ScoredSample::failed(detection));
            }
        }
    }
    samples
}

impl FrameHandler for FrameProcessor {
    fn handle(&mut self, frames: Vec<FrameRef>) {
        let count = frames.len() as u64;
        let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();

        match self.detector.detect(self.camera.id, frames) {
            Ok(per_frame) => {
                for (seq, detections) in seqs.into_iter().zip(per_frame) {
                    self.process_frame(seq, detections);
                }
            }
            Err(e) => {
                // 检测失败的帧与跳过的帧同样处理: 不提交给注册表
                self.stats.detect_failures += count;
                warn!("⚠️ 检测失败 ({} 帧, 首帧 #{}): {}", count, seqs.first().copied().unwrap_or(0), e);
            }
        }
        self.log_throughput(count);
    }
}

/// 摄像头处理单元
pub struct CameraProcessor<S: FrameSource> {
    camera: CameraConfig,
    source: S,
    capture: CapturePipeline,
    connection: ConnectionSupervisor,
    processor: FrameProcessor,
    shutdown: ShutdownSignal,
}

impl<S: FrameSource> CameraProcessor<S> {
    pub fn new(
        camera: CameraConfig,
        config: &AppConfig,
        source: S,
        detector: DetectorHandle,
        selector: BestFrameSelector,
        sink: Arc<dyn OutputSink>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<Self> {
        let capture = CapturePipeline::new(&config.pipeline, detector.batch_size());
        let pool = WorkerPool::new(config.pipeline.worker_threads, &format!("score-{}", camera.id))?;
        let connection = ConnectionSupervisor::new(camera.id, config.reconnect.clone(), shutdown.clone());
        let processor = FrameProcessor::new(
            camera.clone(),
            config,
            detector,
            pool,
            selector,
            sink,
            capture.counters(),
        );
        Ok(Self {
            camera,
            source,
            capture,
            connection,
            processor,
            shutdown,
        })
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// 运行直到流结束/收到关闭信号/重连次数耗尽
    pub fn run(mut self) -> Result<CameraReport, CameraError> {
        let span = info_span!("camera", id = self.camera.id, name = %self.camera.name);
        let _guard = span.enter();

        let mode = match self.capture.mode() {
            ExecutionMode::Sync => "同步".to_string(),
            ExecutionMode::Pipelined { queue_capacity } => format!("流水线 (队列 {})", queue_capacity),
        };
        info!("🎥 摄像头启动: {} | {}", self.source.address(), mode);

        let outcome = loop {
            match self.connection.connect(&mut self.source) {
                ConnectOutcome::Connected => {}
                ConnectOutcome::Failed { attempts } => {
                    break Err(CameraError::ReconnectExhausted {
                        camera: self.camera.id,
                        attempts,
                    })
                }
                ConnectOutcome::Shutdown => break Ok(()),
            }

            match self
                .capture
                .run_session(&mut self.source, &mut self.processor, &self.shutdown)
            {
                SessionEnd::EndOfStream => {
                    info!("🏁 视频流结束");
                    break Ok(());
                }
                SessionEnd::Shutdown => break Ok(()),
                SessionEnd::ReadFailed(e) => {
                    self.source.disconnect();
                    if !self.connection.on_read_failure(&e) {
                        break Ok(());
                    }
                }
            }
        };

        self.source.disconnect();
        self.processor.finish();

        let report = self.report();
        debug!("{:?}", report);
        info!(
            "📊 摄像头结束: 读取 {} | 跳过 {} | 处理 {} | 轨迹 {} | 输出 {} | 输出失败 {}",
            report.frames_read,
            report.frames_skipped,
            report.stats.frames_processed,
            report.stats.tracks_finalized,
            report.stats.artifacts_written,
            report.stats.persist_failures
        );

        match outcome {
            Ok(()) => Ok(report),
            Err(e) => {
                error!("❌ {}", e);
                Err(e)
            }
        }
    }

    fn report(&self) -> CameraReport {
        let counters = self.capture.counters();
        CameraReport {
            camera_id: self.camera.id,
            camera_name: self.camera.name.clone(),
            frames_read: counters.read(),
            frames_skipped: counters.skipped(),
            frames_abandoned: counters.abandoned(),
            stats: self.processor.stats().clone(),
            final_status: self.connection.state().status,
        }
    }
}
