// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 输出系统 (Output System)
///
/// - selector: 最佳帧选择与标注
/// - sink:     JPEG 持久化与文件命名
pub mod selector;
pub mod sink;

pub use selector::{select_best, BestFrameSelector, BestShot};
pub use sink::{artifact_name, JpegDirectorySink, OutputSink};
