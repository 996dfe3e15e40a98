// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 人脸质量评分 (Face quality scoring)
//!
//! 总分 = 加权平均(正脸程度, 清晰度, 检测框质量), 限制在 [0, 1].
//! - 正脸程度: 五点关键点估计偏航(yaw)与俯仰(pitch)
//! - 清晰度: 检测框区域灰度拉普拉斯方差
//! - 检测框质量: 尺寸 + 高宽比, 贴边与过小面积扣分
//!
//! [`QualityScorer::score`] 逐个计算, [`QualityScorer::score_batch`] 使用 ndarray
//! 列式运算 + rayon 并行计算清晰度, 两者结果在浮点误差内一致.

mod batch;

use image::RgbImage;

use crate::config::ScoringConfig;
use crate::detection::types::{BBox, Detection, Landmarks};

/// 退化输入 (零面积框/非有限坐标) 的最低分
pub const MIN_SCORE: f32 = 0.0;
/// 分数上限
pub const MAX_SCORE: f32 = 1.0;

/// 单个检测的评分明细
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityBreakdown {
    pub frontal: f32,
    pub sharpness: f32,
    pub geometry: f32,
    pub total: f32,
    pub degenerate: bool,
}

impl QualityBreakdown {
    fn degenerate() -> Self {
        Self {
            frontal: 0.0,
            sharpness: 0.0,
            geometry: 0.0,
            total: MIN_SCORE,
            degenerate: true,
        }
    }
}

/// 质量评分器: 无状态, 可在多个线程上并发调用
#[derive(Clone, Debug, Default)]
pub struct QualityScorer {
    config: ScoringConfig,
}

impl QualityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// 单个检测评分
    pub fn score(&self, detection: &Detection) -> f32 {
        self.breakdown(detection).total
    }

    /// 批量评分, 与逐个调用 [`score`](Self::score) 等价
    pub fn score_batch(&self, detections: &[Detection]) -> Vec<f32> {
        self.breakdown_batch(detections)
            .into_iter()
            .map(|b| b.total)
            .collect()
    }

    /// 单个检测的评分明细
    pub fn breakdown(&self, detection: &Detection) -> QualityBreakdown {
        let bbox = detection.bbox;
        if bbox.is_degenerate() {
            return QualityBreakdown::degenerate();
        }

        let frame = &detection.frame;
        let frontal = frontal_score(detection.landmarks.as_ref(), self.config.ideal_pitch_balance);
        let sharpness = sharpness_score(&frame.image, &bbox, self.config.sharpness_norm);
        let geometry = geometry_score(&bbox, frame.width() as f32, frame.height() as f32, &self.config);

        QualityBreakdown {
            frontal,
            sharpness,
            geometry,
            total: combine(&self.config, frontal, sharpness, geometry),
            degenerate: false,
        }
    }

    /// 批量评分明细
    pub fn breakdown_batch(&self, detections: &[Detection]) -> Vec<QualityBreakdown> {
        batch::score_columns(&self.config, detections)
    }
}

/// 加权平均并限制范围
fn combine(config: &ScoringConfig, frontal: f32, sharpness: f32, geometry: f32) -> f32 {
    let w = &config.weights;
    let total = (w.frontal * frontal + w.sharpness * sharpness + w.geometry * geometry) / w.total();
    if total.is_finite() {
        total.clamp(MIN_SCORE, MAX_SCORE)
    } else {
        MIN_SCORE
    }
}

/// 正脸程度 [0, 1]
///
/// 偏航: 鼻尖偏离两眼中点的水平距离 / 眼距.
/// 俯仰: 眼-鼻垂直距离占眼-嘴垂直距离的比例, 与理想比例的偏差.
/// 缺少关键点时返回 0.
pub fn frontal_score(landmarks: Option<&Landmarks>, ideal_balance: f32) -> f32 {
    let Some([le, re, nose, lm, rm]) = landmarks.and_then(Landmarks::five_point) else {
        return 0.0;
    };

    let eye_dist = (re.0 - le.0).abs();
    if !(eye_dist > f32::EPSILON) {
        return 0.0;
    }
    let eye_cx = (le.0 + re.0) / 2.0;
    let yaw = (1.0 - (nose.0 - eye_cx).abs() / eye_dist).max(0.0);

    let eye_y = (le.1 + re.1) / 2.0;
    let mouth_y = (lm.1 + rm.1) / 2.0;
    let upper = nose.1 - eye_y;
    let lower = mouth_y - nose.1;
    let pitch = if upper > 0.0 && lower > 0.0 {
        (1.0 - (upper / (upper + lower) - ideal_balance).abs() * 4.0).max(0.0)
    } else {
        0.0
    };

    let score = yaw * pitch;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// 检测框质量 [0, 1]
pub fn geometry_score(bbox: &BBox, frame_w: f32, frame_h: f32, config: &ScoringConfig) -> f32 {
    let area = bbox.w * bbox.h;
    let frame_area = frame_w * frame_h;

    let size = (area / (frame_area * config.ideal_area_fraction)).min(1.0);
    let proportion = (1.0 - (bbox.h / bbox.w - config.ideal_aspect).abs()).max(0.0);
    let base = size * 0.5 + proportion * 0.5;

    let area_factor = if area < config.min_box_area {
        area / config.min_box_area
    } else {
        1.0
    };

    let m = config.edge_margin;
    let touches_edge = bbox.x <= m
        || bbox.y <= m
        || bbox.x + bbox.w >= frame_w - m
        || bbox.y + bbox.h >= frame_h - m;
    let edge_factor = if touches_edge { config.edge_penalty } else { 1.0 };

    let score = base * area_factor * edge_factor;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// 检测框在画面内的整数像素区域 (x0, y0, x1, y1), 不足 3x3 时返回 None
pub(crate) fn pixel_roi(image: &RgbImage, bbox: &BBox) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = image.dimensions();
    // 画面外的框: 起点截到画面边界, 避免 x0 + 3 溢出
    let x0 = (bbox.x.max(0.0).floor() as u32).min(w);
    let y0 = (bbox.y.max(0.0).floor() as u32).min(h);
    let x1 = ((bbox.x + bbox.w).ceil().max(0.0) as u32).min(w);
    let y1 = ((bbox.y + bbox.h).ceil().max(0.0) as u32).min(h);
    if x1 < x0 + 3 || y1 < y0 + 3 {
        return None;
    }
    Some((x0, y0, x1, y1))
}

/// BT.601 亮度
#[inline]
pub(crate) fn luma(p: &image::Rgb<u8>) -> f64 {
    0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
}

/// 清晰度 [0, 1]: 四邻域拉普拉斯响应的方差 / 归一化系数
pub fn sharpness_score(image: &RgbImage, bbox: &BBox, norm: f64) -> f32 {
    let Some((x0, y0, x1, y1)) = pixel_roi(image, bbox) else {
        return 0.0;
    };
    let gray = |x: u32, y: u32| luma(image.get_pixel(x, y));

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for y in (y0 + 1)..(y1 - 1) {
        for x in (x0 + 1)..(x1 - 1) {
            let lap = gray(x - 1, y) + gray(x + 1, y) + gray(x, y - 1) + gray(x, y + 1)
                - 4.0 * gray(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    normalize_sharpness(variance, norm)
}

#[inline]
pub(crate) fn normalize_sharpness(variance: f64, norm: f64) -> f32 {
    let score = (variance / norm).min(1.0) as f32;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::types::{Frame, FrameRef};
    use image::Rgb;

    /// 棋盘格 (高频纹理) 画面
    pub(crate) fn checker_frame(seq: u64, w: u32, h: u32) -> FrameRef {
        let image = RgbImage::from_fn(w, h, |x, y| {
            if (x / 2 + y / 2) % 2 == 0 {
                Rgb([240, 240, 240])
            } else {
                Rgb([20, 20, 20])
            }
        });
        Frame::shared(seq, image)
    }

    pub(crate) fn flat_frame(seq: u64, w: u32, h: u32) -> FrameRef {
        Frame::shared(seq, RgbImage::from_pixel(w, h, Rgb([128, 128, 128])))
    }

    /// 以 (cx, cy) 为中心的正脸关键点
    pub(crate) fn frontal_landmarks(cx: f32, cy: f32, size: f32) -> Landmarks {
        let s = size / 4.0;
        Landmarks::new(vec![
            (cx - s, cy - s),
            (cx + s, cy - s),
            (cx, cy),
            (cx - s * 0.8, cy + s),
            (cx + s * 0.8, cy + s),
        ])
    }

    #[test]
    fn zero_area_box_gets_floor() {
        let scorer = QualityScorer::default();
        let frame = checker_frame(0, 64, 64);
        let det = Detection::new(frame, BBox::new(10.0, 10.0, 0.0, 30.0), 0.99);
        let b = scorer.breakdown(&det);
        assert!(b.degenerate);
        assert_eq!(b.total, MIN_SCORE);
    }

    #[test]
    fn missing_landmarks_zero_frontal() {
        let scorer = QualityScorer::default();
        let frame = checker_frame(0, 200, 200);
        let det = Detection::new(frame, BBox::new(60.0, 50.0, 60.0, 78.0), 0.9);
        let b = scorer.breakdown(&det);
        assert_eq!(b.frontal, 0.0);
        assert!(!b.degenerate);
        assert!(b.total > MIN_SCORE);
    }

    #[test]
    fn frontal_beats_turned_face() {
        let straight = frontal_landmarks(100.0, 100.0, 80.0);
        let mut turned = straight.clone();
        turned.points[2].0 += 18.0; // 鼻尖右移
        let f_straight = frontal_score(Some(&straight), 0.5);
        let f_turned = frontal_score(Some(&turned), 0.5);
        assert!((f_straight - 1.0).abs() < 1e-6);
        assert!(f_turned < f_straight);

        let mut tilted = straight.clone();
        tilted.points[2].1 -= 15.0; // 抬头
        assert!(frontal_score(Some(&tilted), 0.5) < f_straight);
    }

    #[test]
    fn sharp_region_beats_flat_region() {
        let bbox = BBox::new(20.0, 20.0, 40.0, 40.0);
        let sharp = sharpness_score(&checker_frame(0, 100, 100).image, &bbox, 500.0);
        let flat = sharpness_score(&flat_frame(0, 100, 100).image, &bbox, 500.0);
        assert!(sharp > 0.9);
        assert_eq!(flat, 0.0);
    }

    #[test]
    fn tiny_roi_has_no_sharpness() {
        let frame = checker_frame(0, 100, 100);
        assert_eq!(sharpness_score(&frame.image, &BBox::new(10.0, 10.0, 2.0, 2.0), 500.0), 0.0);
        // 完全在画面外
        assert_eq!(
            sharpness_score(&frame.image, &BBox::new(150.0, 150.0, 20.0, 20.0), 500.0),
            0.0
        );
    }

    #[test]
    fn far_outside_box_scores_without_overflow() {
        let image = RgbImage::new(64, 64);
        let far_x = BBox::new(1.0e10, 10.0, 10.0, 10.0);
        let far_y = BBox::new(10.0, 1.0e10, 10.0, 10.0);
        assert_eq!(sharpness_score(&image, &far_x, 1000.0), 0.0);
        assert_eq!(sharpness_score(&image, &far_y, 1000.0), 0.0);

        let scorer = QualityScorer::default();
        let frame = checker_frame(0, 64, 64);
        for bbox in [far_x, far_y] {
            let b = scorer.breakdown(&Detection::new(frame.clone(), bbox, 0.9));
            assert!(!b.degenerate);
            assert!((MIN_SCORE..=MAX_SCORE).contains(&b.total));
        }
    }

    #[test]
    fn edge_and_small_boxes_are_penalized() {
        let config = ScoringConfig::default();
        let centered = geometry_score(&BBox::new(80.0, 60.0, 40.0, 52.0), 200.0, 200.0, &config);
        let edge = geometry_score(&BBox::new(0.0, 60.0, 40.0, 52.0), 200.0, 200.0, &config);
        let small = geometry_score(&BBox::new(80.0, 60.0, 10.0, 13.0), 200.0, 200.0, &config);
        assert!((edge - centered * config.edge_penalty).abs() < 1e-6);
        assert!(small < centered);
    }

    #[test]
    fn score_is_bounded() {
        let scorer = QualityScorer::default();
        let frame = checker_frame(0, 120, 120);
        let det = Detection::new(frame, BBox::new(20.0, 10.0, 80.0, 100.0), 1.0)
            .with_landmarks(frontal_landmarks(60.0, 60.0, 80.0));
        let s = scorer.score(&det);
        assert!((MIN_SCORE..=MAX_SCORE).contains(&s));
        assert!(s > 0.5);
    }
}
