// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// 所有输入源实现 [`FrameSource`], 由 ConnectionSupervisor 负责连接与重连
/// - SequenceSource:  图片目录回放 (离线复现)
/// - SyntheticSource: 合成画面 (演示/测试)
/// - RtspSource:      RTSP 拉流解码 (需要 `ffmpeg` 特性)
pub mod sequence;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod decoder;

use std::path::Path;

use image::RgbImage;

use crate::config::{CameraConfig, PipelineConfig};
use crate::error::SourceError;

pub use sequence::SequenceSource;
pub use synthetic::SyntheticSource;

#[cfg(feature = "ffmpeg")]
pub use decoder::RtspSource;

/// 帧输入源
///
/// `read` 返回 `Ok(None)` 表示流正常结束; 返回 `Err` 表示连接中断, 需要重连.
/// 实现方负责给阻塞读取设置超时.
pub trait FrameSource: Send {
    fn address(&self) -> &str;

    fn connect(&mut self) -> Result<(), SourceError>;

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError>;

    fn disconnect(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn address(&self) -> &str {
        (**self).address()
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        (**self).connect()
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        (**self).read()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

/// 按地址格式创建输入源
/// - `synthetic://WxH?frames=N`: 合成画面
/// - `rtsp://...`: RTSP 流
/// - 其他: 图片目录
pub fn open_source(
    camera: &CameraConfig,
    pipeline: &PipelineConfig,
) -> anyhow::Result<Box<dyn FrameSource>> {
    let address = camera.source.trim();
    if address.starts_with("synthetic://") {
        return Ok(Box::new(SyntheticSource::parse(address, camera.id as u64)?));
    }
    if address.starts_with("rtsp://") || address.starts_with("rtsps://") {
        return open_rtsp(address, pipeline);
    }
    if Path::new(address).is_dir() {
        return Ok(Box::new(SequenceSource::new(address)));
    }
    anyhow::bail!("unsupported source address for camera {}: {}", camera.id, address)
}

#[cfg(feature = "ffmpeg")]
fn open_rtsp(address: &str, pipeline: &PipelineConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    Ok(Box::new(RtspSource::new(
        address.to_string(),
        std::time::Duration::from_millis(pipeline.read_timeout_ms),
        pipeline.queue_capacity,
    )))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_rtsp(address: &str, _pipeline: &PipelineConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    anyhow::bail!(
        "RTSP source {} requires building with `--features ffmpeg`",
        address
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(source: &str) -> CameraConfig {
        CameraConfig {
            id: 1,
            name: "test".to_string(),
            source: source.to_string(),
        }
    }

    #[test]
    fn picks_source_by_address() {
        let pipeline = PipelineConfig::default();
        let synthetic = open_source(&camera("synthetic://64x48?frames=3"), &pipeline).unwrap();
        assert_eq!(synthetic.address(), "synthetic://64x48?frames=3");

        let dir = tempfile::tempdir().unwrap();
        let seq = open_source(&camera(dir.path().to_str().unwrap()), &pipeline).unwrap();
        assert_eq!(seq.address(), dir.path().to_str().unwrap());

        assert!(open_source(&camera("/definitely/not/here"), &pipeline).is_err());
    }
}
