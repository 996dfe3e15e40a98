// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 多路摄像头最佳人脸帧选择
//!
//! 每个摄像头: 拉流 → 外部检测/跟踪 → 质量评分 → 按轨迹缓存 → 轨迹结束时输出一张最佳帧

pub mod config; // 配置加载与校验
pub mod demo; // 演示用合成检测器
pub mod detection; // 检测数据类型与检测器服务
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod output; // 选帧与持久化
pub mod pipeline; // 摄像头处理流水线
pub mod pool; // 评分线程池
pub mod quality; // 人脸质量评分
pub mod track; // 轨迹生命周期

pub use crate::config::{AppConfig, CameraConfig};
pub use crate::detection::{BBox, Detection, Detector, Frame, FrameRef, Landmarks};
pub use crate::output::{BestFrameSelector, BestShot, JpegDirectorySink, OutputSink};
pub use crate::pipeline::{CameraProcessor, CameraReport, ShutdownSignal, Supervisor};
pub use crate::quality::QualityScorer;
pub use crate::track::{FinishedTrack, ScoredSample, TrackRegistry};
