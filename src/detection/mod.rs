// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统 (Detection System)
///
/// 外部检测/跟踪模型的边界
/// - types:    帧与检测结果
/// - detector: 检测器接口与串行化的共享检测服务
pub mod detector;
pub mod types;

pub use detector::{Detector, DetectorHandle, DetectorService};
pub use types::{BBox, Detection, Frame, FrameRef, Landmarks};
