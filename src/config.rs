// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行配置 - 通过JSON文件调整参数
//!
//! 所有字段都有默认值, 配置文件只需写出要覆盖的部分.
//! [`AppConfig::validate`] 在任何摄像头启动之前执行, 发现问题立即失败.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// 检测器参数 (传递给外部检测/跟踪模型)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub device: String,            // 推理设备: "cpu" / "cuda:0"
    pub batch_size: Option<usize>, // 推理批次, None 时按设备选择
    pub inference_size: u32,       // 推理输入尺寸
    pub request_queue: usize,      // 检测请求队列容量
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            batch_size: None,
            inference_size: 640,
            request_queue: 16,
        }
    }
}

impl DetectorConfig {
    pub fn is_gpu(&self) -> bool {
        let device = self.device.to_ascii_lowercase();
        device.starts_with("cuda") || device.starts_with("gpu") || device.starts_with("tensorrt")
    }

    /// GPU 默认批次 32, CPU 默认批次 4
    pub fn effective_batch_size(&self) -> usize {
        match self.batch_size {
            Some(n) => n,
            None if self.is_gpu() => 32,
            None => 4,
        }
    }
}

/// 超过单轨迹样本上限时的处理策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOverflow {
    /// 丢弃最早的样本
    EvictOldest,
    /// 提前结束轨迹并输出
    FinalizeEarly,
}

/// 轨迹生命周期参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub max_frames_lost: u32,         // 连续丢失多少帧后结束轨迹
    pub max_active_tracks: usize,     // 活跃轨迹上限
    pub max_samples_per_track: usize, // 单轨迹样本上限
    pub sample_overflow: SampleOverflow,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_frames_lost: 30,
            max_active_tracks: 256,
            max_samples_per_track: 300,
            sample_overflow: SampleOverflow::FinalizeEarly,
        }
    }
}

/// 重连参数 (固定间隔, 不做指数退避)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: 5000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// 采集管线参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection_cadence: u64,  // 每N帧检测一次
    pub pipelined: bool,         // 读取与处理并行
    pub queue_capacity: usize,   // 读取队列容量
    pub drain_on_shutdown: bool, // 退出时处理完队列中的帧
    pub worker_threads: usize,   // 评分线程数, 0 = 自动
    pub bulk_scoring: bool,      // 批量向量化评分
    pub read_timeout_ms: u64,    // 单帧读取超时
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_cadence: 1,
            pipelined: true,
            queue_capacity: 8,
            drain_on_shutdown: true,
            worker_threads: 0,
            bulk_scoring: true,
            read_timeout_ms: 10_000,
        }
    }
}

/// 质量分子项权重
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub frontal: f32,
    pub sharpness: f32,
    pub geometry: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            frontal: 0.5,
            sharpness: 0.15,
            geometry: 0.35,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f32 {
        self.frontal + self.sharpness + self.geometry
    }
}

/// 质量评分参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub min_box_area: f32,        // 低于该面积按比例扣分 (像素²)
    pub edge_margin: f32,         // 贴边判定距离 (像素)
    pub edge_penalty: f32,        // 贴边系数
    pub ideal_area_fraction: f32, // 框面积达到画面该比例时尺寸分满分
    pub ideal_aspect: f32,        // 理想高宽比
    pub sharpness_norm: f64,      // 拉普拉斯方差归一化系数
    pub ideal_pitch_balance: f32, // 眼-鼻 / 眼-嘴 理想比例
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            min_box_area: 400.0,
            edge_margin: 2.0,
            edge_penalty: 0.5,
            ideal_area_fraction: 0.3,
            ideal_aspect: 1.3,
            sharpness_norm: 500.0,
            ideal_pitch_balance: 0.5,
        }
    }
}

/// 默认JPEG质量 (高质量, 所有输出共用)
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// 输出参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub jpeg_quality: u8,
    pub font_path: Option<PathBuf>, // 标签字体, 为空时使用内置点阵字体
    pub clear_on_start: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./best_frames"),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            font_path: None,
            clear_on_start: false,
        }
    }
}

/// 运动判定参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub min_displacement_px: f32,
    pub min_moving_fraction: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            min_displacement_px: 50.0,
            min_moving_fraction: 0.3,
        }
    }
}

/// 摄像头身份 (只用于命名和日志)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: u32,
    pub name: String,
    pub source: String,
}

/// 全局配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub detector: DetectorConfig,
    pub tracking: TrackingConfig,
    pub reconnect: ReconnectConfig,
    pub pipeline: PipelineConfig,
    pub scoring: ScoringConfig,
    pub output: OutputConfig,
    pub movement: MovementConfig,
    pub cameras: Vec<CameraConfig>,
}

impl AppConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 启动前校验
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.source.trim().is_empty() {
                return Err(ConfigError::MissingSource { id: camera.id });
            }
            if !seen.insert(camera.id) {
                return Err(ConfigError::DuplicateCamera { id: camera.id });
            }
        }

        at_least_one("tracking.max_frames_lost", self.tracking.max_frames_lost as u64)?;
        at_least_one("tracking.max_active_tracks", self.tracking.max_active_tracks as u64)?;
        at_least_one(
            "tracking.max_samples_per_track",
            self.tracking.max_samples_per_track as u64,
        )?;
        at_least_one("reconnect.max_attempts", self.reconnect.max_attempts as u64)?;
        at_least_one("pipeline.detection_cadence", self.pipeline.detection_cadence)?;
        at_least_one("pipeline.queue_capacity", self.pipeline.queue_capacity as u64)?;
        at_least_one(
            "detector.batch_size",
            self.detector.effective_batch_size() as u64,
        )?;

        let w = &self.scoring.weights;
        if [w.frontal, w.sharpness, w.geometry]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
            || w.total() <= 0.0
        {
            return Err(ConfigError::Invalid {
                field: "scoring.weights",
                reason: "weights must be non-negative and sum to a positive value".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.scoring.edge_penalty) {
            return Err(ConfigError::Invalid {
                field: "scoring.edge_penalty",
                reason: format!("{} is outside [0, 1]", self.scoring.edge_penalty),
            });
        }
        if self.scoring.sharpness_norm <= 0.0 || self.scoring.ideal_area_fraction <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "scoring",
                reason: "sharpness_norm and ideal_area_fraction must be positive".to_string(),
            });
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(ConfigError::Invalid {
                field: "output.jpeg_quality",
                reason: format!("{} is outside 1..=100", self.output.jpeg_quality),
            });
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前配置:");
        info!(
            "  检测器: {} | 批次 {}",
            self.detector.device,
            self.detector.effective_batch_size()
        );
        info!("  最大丢失帧: {}", self.tracking.max_frames_lost);
        info!(
            "  重连: 间隔 {}ms, 最多 {} 次",
            self.reconnect.delay_ms, self.reconnect.max_attempts
        );
        info!(
            "  管线: {} | 队列 {} | 检测间隔 {}",
            if self.pipeline.pipelined { "并行" } else { "同步" },
            self.pipeline.queue_capacity,
            self.pipeline.detection_cadence
        );
        info!("  输出目录: {}", self.output.directory.display());
        info!("  摄像头数量: {}", self.cameras.len());
    }
}

fn at_least_one(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}
