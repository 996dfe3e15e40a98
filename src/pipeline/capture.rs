// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集管线 (CapturePipeline)
//!
//! 两种执行模式:
//! - 同步: 读取 → 检测 → 处理 严格串行, 延迟和内存最低
//! - 流水线: 读取线程与处理线程并行, 中间是容量为 Q 的有界队列
//!   队列满时读取端阻塞 (背压), 队列空时处理端阻塞
//!
//! 帧序号在重连之间连续递增. 按检测间隔被跳过的帧不会进入队列,
//! 也不会提交给轨迹注册表.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, SendTimeoutError, TryRecvError};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::shutdown::ShutdownSignal;
use crate::config::PipelineConfig;
use crate::detection::{Frame, FrameRef};
use crate::error::SourceError;
use crate::input::FrameSource;

/// 读取端在队列满时检查关闭信号的间隔
const SEND_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Sync,
    Pipelined { queue_capacity: usize },
}

impl ExecutionMode {
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.pipelined {
            Self::Pipelined {
                queue_capacity: config.queue_capacity.max(1),
            }
        } else {
            Self::Sync
        }
    }
}

/// 处理阶段: 按采集顺序接收一批帧
pub trait FrameHandler {
    fn handle(&mut self, frames: Vec<FrameRef>);
}

/// 一次连接会话的结束原因
#[derive(Debug)]
pub enum SessionEnd {
    EndOfStream,
    Shutdown,
    ReadFailed(SourceError),
}

/// 采集计数, 读取线程写入, 处理线程读取
#[derive(Debug, Default)]
pub struct CaptureCounters {
    read: AtomicU64,
    skipped: AtomicU64,
    abandoned: AtomicU64,
}

impl CaptureCounters {
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// 按检测间隔跳过的帧
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// 关闭时未处理就丢弃的排队帧
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// 帧准入: 分配序号, 执行检测间隔
struct Admission {
    next_seq: u64,
    cadence: u64,
    counters: Arc<CaptureCounters>,
}

impl Admission {
    fn admit(&mut self, image: RgbImage) -> Option<FrameRef> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.counters.read.fetch_add(1, Ordering::Relaxed);
        if seq % self.cadence != 0 {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(Frame::shared(seq, image))
    }
}

enum ReaderEvent {
    Frame(FrameRef),
    Failed(SourceError),
    End,
}

pub struct CapturePipeline {
    mode: ExecutionMode,
    batch_size: usize,
    drain_on_shutdown: bool,
    admission: Admission,
}

impl CapturePipeline {
    pub fn new(config: &PipelineConfig, batch_size: usize) -> Self {
        Self {
            mode: ExecutionMode::from_config(config),
            batch_size: batch_size.max(1),
            drain_on_shutdown: config.drain_on_shutdown,
            admission: Admission {
                next_seq: 0,
                cadence: config.detection_cadence.max(1),
                counters: Arc::new(CaptureCounters::default()),
            },
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.admission.counters.clone()
    }

    /// 在已连接的输入源上运行, 直到流结束/读取失败/收到关闭信号
    pub fn run_session<S, H>(
        &mut self,
        source: &mut S,
        handler: &mut H,
        shutdown: &ShutdownSignal,
    ) -> SessionEnd
    where
        S: FrameSource + ?Sized,
        H: FrameHandler,
    {
        match self.mode {
            ExecutionMode::Sync => self.run_sync(source, handler, shutdown),
            ExecutionMode::Pipelined { queue_capacity } => {
                self.run_pipelined(source, handler, shutdown, queue_capacity)
            }
        }
    }

    fn run_sync<S, H>(&mut self, source: &mut S, handler: &mut H, shutdown: &ShutdownSignal) -> SessionEnd
    where
        S: FrameSource + ?Sized,
        H: FrameHandler,
    {
        loop {
            if shutdown.is_triggered() {
                return SessionEnd::Shutdown;
            }
            match source.read() {
                Ok(Some(image)) => {
                    if let Some(frame) = self.admission.admit(image) {
                        handler.handle(vec![frame]);
                    }
                }
                Ok(None) => return SessionEnd::EndOfStream,
                Err(e) => return SessionEnd::ReadFailed(e),
            }
        }
    }

    fn run_pipelined<S, H>(
        &mut self,
        source: &mut S,
        handler: &mut H,
        shutdown: &ShutdownSignal,
        queue_capacity: usize,
    ) -> SessionEnd
    where
        S: FrameSource + ?Sized,
        H: FrameHandler,
    {
        let (tx, rx) = bounded::<ReaderEvent>(queue_capacity);
        let batch_size = self.batch_size;
        let drain = self.drain_on_shutdown;
        let admission = &mut self.admission;
        let counters = admission.counters.clone();
        let address = source.address().to_string();

        std::thread::scope(|scope| {
            // 读取阶段
            let reader = std::thread::Builder::new()
                .name("frame-reader".to_string())
                .spawn_scoped(scope, move || loop {
                    if shutdown.is_triggered() {
                        return;
                    }
                    let mut event = match source.read() {
                        Ok(Some(image)) => match admission.admit(image) {
                            Some(frame) => ReaderEvent::Frame(frame),
                            None => continue,
                        },
                        Ok(None) => ReaderEvent::End,
                        Err(e) => ReaderEvent::Failed(e),
                    };
                    let last = !matches!(event, ReaderEvent::Frame(_));
                    // 队列满时阻塞, 期间仍响应关闭信号
                    loop {
                        match tx.send_timeout(event, SEND_POLL) {
                            Ok(()) => break,
                            Err(SendTimeoutError::Timeout(back)) => {
                                if shutdown.is_triggered() {
                                    if matches!(back, ReaderEvent::Frame(_)) {
                                        admission.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                                    }
                                    return;
                                }
                                event = back;
                            }
                            Err(SendTimeoutError::Disconnected(_)) => return,
                        }
                    }
                    if last {
                        return;
                    }
                });

            if let Err(e) = reader {
                warn!("⚠️ 读取线程启动失败: {}", e);
                return SessionEnd::ReadFailed(SourceError::Read {
                    address,
                    reason: format!("failed to start reader: {}", e),
                });
            }

            // 处理阶段: 队列中已有的帧合并成一批, 不等待凑满
            let mut end = None;
            while let Ok(event) = rx.recv() {
                let first = match event {
                    ReaderEvent::Frame(frame) => frame,
                    ReaderEvent::End => {
                        end = Some(SessionEnd::EndOfStream);
                        break;
                    }
                    ReaderEvent::Failed(e) => {
                        end = Some(SessionEnd::ReadFailed(e));
                        break;
                    }
                };
                if shutdown.is_triggered() && !drain {
                    counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let mut batch = vec![first];
                while batch.len() < batch_size {
                    match rx.try_recv() {
                        Ok(ReaderEvent::Frame(frame)) => batch.push(frame),
                        Ok(ReaderEvent::End) => {
                            end = Some(SessionEnd::EndOfStream);
                            break;
                        }
                        Ok(ReaderEvent::Failed(e)) => {
                            end = Some(SessionEnd::ReadFailed(e));
                            break;
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                debug!("处理批次: {} 帧 (首帧 #{})", batch.len(), batch[0].seq);
                handler.handle(batch);
                if end.is_some() {
                    break;
                }
            }
            drop(rx);

            let end = end.unwrap_or(SessionEnd::Shutdown);
            if matches!(end, SessionEnd::Shutdown) {
                info!(
                    "🛑 采集停止 (已读取 {} 帧, 丢弃排队 {} 帧)",
                    counters.read(),
                    counters.abandoned()
                );
            }
            end
        })
    }
}
