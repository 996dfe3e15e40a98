// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::sync::Arc;

use chrono::{DateTime, Local};
use image::RgbImage;

/// 检测/跟踪数据结构定义
/// Data structures shared by the detection and tracking stages

// ========== 公共常量 ==========

/// 人脸关键点数量 (左眼, 右眼, 鼻尖, 左嘴角, 右嘴角)
pub const FACE_LANDMARKS: usize = 5;

// ========== 数据结构 ==========

/// 已采集帧 (读取线程 → 处理线程)
///
/// 帧只会被整体共享, 从不就地修改: 多个样本通过 [`FrameRef`] 引用同一帧,
/// 最后一个引用释放时帧内存才被回收.
#[derive(Debug)]
pub struct Frame {
    /// 摄像头内单调递增的帧序号
    pub seq: u64,
    pub captured_at: DateTime<Local>,
    pub image: RgbImage,
}

/// 引用计数的帧 (零拷贝共享)
pub type FrameRef = Arc<Frame>;

impl Frame {
    pub fn new(seq: u64, captured_at: DateTime<Local>, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at,
            image,
        }
    }

    pub fn shared(seq: u64, image: RgbImage) -> FrameRef {
        Arc::new(Self::new(seq, Local::now(), image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// 检测框 (左上角 + 宽高, 像素坐标)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// 从两点坐标构造 (x1, y1, x2, y2)
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// 零面积/负尺寸/非有限值都视为退化框
    pub fn is_degenerate(&self) -> bool {
        !(self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite())
            || self.w <= 0.0
            || self.h <= 0.0
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x, self.y, self.w, self.h]
    }
}

/// 人脸关键点
#[derive(Clone, Debug, PartialEq)]
pub struct Landmarks {
    pub points: Vec<(f32, f32)>,
}

impl Landmarks {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    /// 五点关键点 (不足五点时返回 None)
    pub fn five_point(&self) -> Option<[(f32, f32); FACE_LANDMARKS]> {
        if self.points.len() < FACE_LANDMARKS {
            return None;
        }
        let mut out = [(0.0, 0.0); FACE_LANDMARKS];
        out.copy_from_slice(&self.points[..FACE_LANDMARKS]);
        Some(out)
    }
}

/// 单个检测结果 (检测器 → 处理线程), 产生后不再修改
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
    /// 跟踪ID, None 表示未关联
    pub track_id: Option<u64>,
    pub frame: FrameRef,
}

impl Detection {
    pub fn new(frame: FrameRef, bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            landmarks: None,
            track_id: None,
            frame,
        }
    }

    pub fn with_track(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_landmarks(mut self, landmarks: Landmarks) -> Self {
        self.landmarks = Some(landmarks);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_boxes() {
        assert!(BBox::new(10.0, 10.0, 0.0, 20.0).is_degenerate());
        assert!(BBox::new(10.0, 10.0, 20.0, -1.0).is_degenerate());
        assert!(BBox::new(f32::NAN, 10.0, 20.0, 20.0).is_degenerate());
        assert!(!BBox::new(0.0, 0.0, 1.0, 1.0).is_degenerate());
    }

    #[test]
    fn corners_and_center() {
        let b = BBox::from_corners(10.0, 20.0, 50.0, 80.0);
        assert_eq!(b.w, 40.0);
        assert_eq!(b.h, 60.0);
        assert_eq!(b.center(), (30.0, 50.0));
        assert_eq!(b.area(), 2400.0);
    }

    #[test]
    fn five_point_requires_all_landmarks() {
        let short = Landmarks::new(vec![(1.0, 1.0); 3]);
        assert!(short.five_point().is_none());
        let full = Landmarks::new((0..6).map(|i| (i as f32, 0.0)).collect());
        let five = full.five_point().unwrap();
        assert_eq!(five[4], (4.0, 0.0));
    }

    #[test]
    fn detections_share_frame() {
        let frame = Frame::shared(3, RgbImage::new(8, 8));
        let a = Detection::new(frame.clone(), BBox::new(0.0, 0.0, 2.0, 2.0), 0.9).with_track(1);
        let b = Detection::new(frame.clone(), BBox::new(4.0, 4.0, 2.0, 2.0), 0.8);
        assert!(Arc::ptr_eq(&a.frame, &b.frame));
        assert_eq!(Arc::strong_count(&frame), 3);
        assert_eq!(a.track_id, Some(1));
        assert_eq!(b.track_id, None);
    }
}
