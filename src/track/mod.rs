// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 轨迹生命周期 (Track lifecycle)
///
/// - buffer: 单条轨迹的样本缓冲与统计
/// - registry: ACTIVE → FINISHED 状态机
pub mod buffer;
pub mod registry;

pub use buffer::{FinishReason, FinishedTrack, MovementStats, ScoredSample, Track, TrackSummary};
pub use registry::TrackRegistry;
