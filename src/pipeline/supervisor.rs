// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 主控 (Supervisor)
//!
//! 启动前校验配置 (失败立即返回), 为每个摄像头创建一个处理单元并运行在独立线程中.
//! 所有摄像头共享同一个检测服务句柄和输出端, 其余状态互不共享.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use tracing::{error, info};

use super::camera::{CameraProcessor, CameraReport};
use super::shutdown::ShutdownSignal;
use crate::config::{AppConfig, CameraConfig};
use crate::detection::{Detector, DetectorService};
use crate::error::{CameraError, ConfigError};
use crate::input::FrameSource;
use crate::output::{BestFrameSelector, OutputSink};
use crate::pool::panic_message;

/// 单个摄像头的运行结果
#[derive(Debug)]
pub struct CameraResult {
    pub camera: CameraConfig,
    pub outcome: Result<CameraReport, CameraError>,
}

pub struct Supervisor {
    config: AppConfig,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 运行所有摄像头直到全部结束, 返回每个摄像头的结果
    ///
    /// `open` 为每个摄像头创建输入源; 全部创建成功后才启动任何处理线程.
    pub fn run<D, F>(
        &self,
        detector: D,
        mut open: F,
        sink: Arc<dyn OutputSink>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<Vec<CameraResult>>
    where
        D: Detector + 'static,
        F: FnMut(&CameraConfig) -> anyhow::Result<Box<dyn FrameSource>>,
    {
        let font = match &self.config.output.font_path {
            Some(path) => Some(BestFrameSelector::load_font(path).map_err(|e| ConfigError::Invalid {
                field: "output.font_path",
                reason: format!("{}: {:#}", path.display(), e),
            })?),
            None => None,
        };
        let selector = BestFrameSelector::new(self.config.movement.clone(), font);

        let service = DetectorService::spawn(detector, &self.config.detector)
            .context("failed to start detector service")?;

        let mut units = Vec::with_capacity(self.config.cameras.len());
        for camera in &self.config.cameras {
            let source =
                open(camera).with_context(|| format!("failed to open source for camera {}", camera.id))?;
            units.push(CameraProcessor::new(
                camera.clone(),
                &self.config,
                source,
                service.handle(),
                selector.clone(),
                sink.clone(),
                shutdown.clone(),
            )?);
        }
        info!("🚀 启动 {} 路摄像头", units.len());

        let mut threads: Vec<(CameraConfig, JoinHandle<Result<CameraReport, CameraError>>)> =
            Vec::with_capacity(units.len());
        for unit in units {
            let camera = unit.camera().clone();
            let spawned = std::thread::Builder::new()
                .name(format!("camera-{}", camera.id))
                .spawn(move || unit.run());
            match spawned {
                Ok(handle) => threads.push((camera, handle)),
                Err(e) => {
                    // 已启动的摄像头先停下再返回
                    error!("❌ 摄像头 {} 线程启动失败: {}", camera.id, e);
                    shutdown.trigger();
                    for (_, handle) in threads {
                        let _ = handle.join();
                    }
                    return Err(anyhow::Error::new(e).context(format!("failed to spawn camera {}", camera.id)));
                }
            }
        }

        let mut results = Vec::with_capacity(threads.len());
        for (camera, handle) in threads {
            let outcome = handle.join().unwrap_or_else(|payload| {
                Err(CameraError::Panicked {
                    camera: camera.id,
                    message: panic_message(payload.as_ref()),
                })
            });
            match &outcome {
                Ok(report) => info!(
                    "✅ 摄像头 {} ({}) 结束: 输出 {} 张",
                    camera.id, camera.name, report.stats.artifacts_written
                ),
                Err(e) => error!("❌ 摄像头 {} ({}) 异常结束: {}", camera.id, camera.name, e),
            }
            results.push(CameraResult { camera, outcome });
        }

        service.shutdown();
        Ok(results)
    }
}
