// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! FFmpeg解码过滤器: YUV420P → RgbImage, 送入有界帧队列
//!
//! 队列满时丢弃新帧 (实时流不回放), 停止标志置位或接收端释放后返回错误结束解码图.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use image::RgbImage;
use tracing::{debug, info, warn};

/// 分辨率上限
const MAX_DIMENSION: u32 = 8192;

pub struct DecodeFilter {
    address: String,
    tx: Sender<RgbImage>,
    stop: Arc<AtomicBool>,
    count: usize,
    last: Instant,
    total_frames: usize,
    dropped_frames: usize,
    queue_full: usize,
}

impl DecodeFilter {
    pub fn new(address: String, tx: Sender<RgbImage>, stop: Arc<AtomicBool>) -> Self {
        Self {
            address,
            tx,
            stop,
            count: 0,
            last: Instant::now(),
            total_frames: 0,
            dropped_frames: 0,
            queue_full: 0,
        }
    }

    fn drop_frame(&mut self, reason: &str) -> Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            warn!("⚠️ 丢弃帧 #{}: {}", self.total_frames, reason);
        }
        Ok(None)
    }

    fn log_stats(&mut self) {
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed < 1.0 {
            return;
        }
        debug!(
            "📺 解码统计: {:.1}fps | 总帧 {} | 丢弃 {} | 队列满 {}",
            self.count as f64 / elapsed,
            self.total_frames,
            self.dropped_frames,
            self.queue_full
        );
        self.last = Instant::now();
        self.count = 0;
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("✅ 解码开始: {}", self.address);
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            return Err("decoder stopped".to_string());
        }
        self.total_frames += 1;

        let image = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return self.drop_frame("空帧/损坏帧");
            }
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as u32, raw.height as u32);
            if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
                return self.drop_frame("非法分辨率");
            }
            // 缺少参考帧/无效比特流
            if raw.decode_error_flags & 0x03 != 0 {
                return self.drop_frame("解码错误");
            }

            let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                return self.drop_frame("YUV指针为空");
            }
            if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
                return self.drop_frame("步长异常");
            }

            let mut buffer = vec![0u8; (w * h * 3) as usize];
            yuv420p_to_rgb(
                y_plane,
                u_plane,
                v_plane,
                y_stride,
                uv_stride,
                &mut buffer,
                w as usize,
                h as usize,
            );
            match RgbImage::from_raw(w, h, buffer) {
                Some(image) => image,
                None => return self.drop_frame("缓冲区尺寸不符"),
            }
        };

        self.count += 1;
        match self.tx.try_send(image) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.queue_full += 1,
            Err(TrySendError::Disconnected(_)) => return Err("frame receiver closed".to_string()),
        }
        self.log_stats();
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!(
            "🛑 解码结束: {} (总帧 {}, 丢弃 {}, 队列满 {})",
            self.address, self.total_frames, self.dropped_frames, self.queue_full
        );
    }
}

/// BT.601 YUV420P → RGB24 (定点系数 ×128)
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;
        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out + 1] = (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out += 3;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grey_yuv_maps_to_grey_rgb() {
        // 4x2, Y=100, U=V=128 (无色度)
        let y = [100u8; 8];
        let u = [128u8; 2];
        let v = [128u8; 2];
        let mut rgb = [0u8; 24];
        unsafe { yuv420p_to_rgb(y.as_ptr(), u.as_ptr(), v.as_ptr(), 4, 2, &mut rgb, 4, 2) };
        assert!(rgb.iter().all(|&c| c == 100));
    }
}
