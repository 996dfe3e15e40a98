// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 摄像头处理流水线 (Camera Processing Pipeline)
///
/// 每个摄像头一个处理单元, 独立线程运行:
/// - connection: 连接/重连状态机
/// - capture:    读取与处理 (同步 / 流水线两种模式)
/// - camera:     检测 → 评分 → 轨迹 → 选帧 → 输出
/// - supervisor: 配置校验, 启动并等待所有摄像头
pub mod camera;
pub mod capture;
pub mod connection;
pub mod shutdown;
pub mod supervisor;

pub use camera::{CameraProcessor, CameraReport, FrameProcessor, ProcessingStats};
pub use capture::{CaptureCounters, CapturePipeline, ExecutionMode, FrameHandler, SessionEnd};
pub use connection::{CameraState, ConnectOutcome, ConnectionStatus, ConnectionSupervisor};
pub use shutdown::ShutdownSignal;
pub use supervisor::{CameraResult, Supervisor};
