// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 批量评分: 把一帧内所有检测的几何信息排成列, 用 ndarray 整列计算;
//! 清晰度按检测并行 (rayon), 在调用方所在的线程池中执行.

use ndarray::{s, Array1, Array2, Zip};
use rayon::prelude::*;

use super::{luma, normalize_sharpness, pixel_roi, QualityBreakdown, MAX_SCORE, MIN_SCORE};
use crate::config::ScoringConfig;
use crate::detection::types::{Detection, FACE_LANDMARKS};

// 列索引
const X: usize = 0;
const Y: usize = 1;
const W: usize = 2;
const H: usize = 3;
const FW: usize = 4;
const FH: usize = 5;

pub(super) fn score_columns(config: &ScoringConfig, detections: &[Detection]) -> Vec<QualityBreakdown> {
    let n = detections.len();
    if n == 0 {
        return Vec::new();
    }

    // ========== 组装列数据 ==========
    let mut geo = Array2::<f32>::zeros((n, 6));
    let mut marks = Array2::<f32>::zeros((n, FACE_LANDMARKS * 2));
    let mut has_marks = Array1::<bool>::from_elem(n, false);
    let mut degenerate = Array1::<bool>::from_elem(n, false);

    for (i, det) in detections.iter().enumerate() {
        let b = det.bbox;
        geo.row_mut(i).assign(&Array1::from(vec![
            b.x,
            b.y,
            b.w,
            b.h,
            det.frame.width() as f32,
            det.frame.height() as f32,
        ]));
        degenerate[i] = b.is_degenerate();
        if let Some(points) = det.landmarks.as_ref().and_then(|l| l.five_point()) {
            has_marks[i] = true;
            for (k, (px, py)) in points.iter().enumerate() {
                marks[[i, k * 2]] = *px;
                marks[[i, k * 2 + 1]] = *py;
            }
        }
    }

    let geometry = geometry_columns(config, &geo);
    let frontal = frontal_columns(config.ideal_pitch_balance, &marks, &has_marks);

    // 清晰度: 逐检测遍历像素, 数据并行
    let sharpness: Array1<f32> = detections
        .par_iter()
        .map(|det| {
            if det.bbox.is_degenerate() {
                0.0
            } else {
                laplacian_variance(det)
                    .map(|v| normalize_sharpness(v, config.sharpness_norm))
                    .unwrap_or(0.0)
            }
        })
        .collect::<Vec<_>>()
        .into();

    // ========== 加权合成 ==========
    let w = config.weights;
    let total_w = w.total();
    let mut out = Vec::with_capacity(n);
    Zip::from(&frontal)
        .and(&sharpness)
        .and(&geometry)
        .and(&degenerate)
        .for_each(|&f, &s, &g, &bad| {
            if bad {
                out.push(QualityBreakdown::degenerate());
                return;
            }
            let total = (w.frontal * f + w.sharpness * s + w.geometry * g) / total_w;
            let total = if total.is_finite() {
                total.clamp(MIN_SCORE, MAX_SCORE)
            } else {
                MIN_SCORE
            };
            out.push(QualityBreakdown {
                frontal: f,
                sharpness: s,
                geometry: g,
                total,
                degenerate: false,
            });
        });
    out
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn geometry_columns(config: &ScoringConfig, geo: &Array2<f32>) -> Array1<f32> {
    let x = geo.column(X);
    let y = geo.column(Y);
    let w = geo.column(W);
    let h = geo.column(H);
    let fw = geo.column(FW);
    let fh = geo.column(FH);

    let area = &w * &h;
    let frame_area = &fw * &fh;

    let size = Zip::from(&area)
        .and(&frame_area)
        .map_collect(|&a, &fa| (a / (fa * config.ideal_area_fraction)).min(1.0));
    let proportion = Zip::from(&h)
        .and(&w)
        .map_collect(|&h, &w| (1.0 - (h / w - config.ideal_aspect).abs()).max(0.0));
    let base = &size * 0.5 + &proportion * 0.5;

    let area_factor = area.mapv(|a| {
        if a < config.min_box_area {
            a / config.min_box_area
        } else {
            1.0
        }
    });

    let m = config.edge_margin;
    let mut edge_factor = Array1::<f32>::ones(x.len());
    Zip::from(&mut edge_factor)
        .and(&x)
        .and(&y)
        .and(&w)
        .and(&h)
        .and(geo.slice(s![.., FW..=FH]).rows())
        .for_each(|e, &x, &y, &w, &h, frame| {
            if x <= m || y <= m || x + w >= frame[0] - m || y + h >= frame[1] - m {
                *e = config.edge_penalty;
            }
        });

    let score = &base * &area_factor * &edge_factor;
    score.mapv(|v| finite_or_zero(v).clamp(0.0, 1.0))
}

fn frontal_columns(ideal_balance: f32, marks: &Array2<f32>, has: &Array1<bool>) -> Array1<f32> {
    let col = |k: usize| marks.column(k);
    let (le_x, le_y) = (col(0), col(1));
    let (re_x, re_y) = (col(2), col(3));
    let (nose_x, nose_y) = (col(4), col(5));
    let lm_y = col(7);
    let rm_y = col(9);

    let eye_dist = (&re_x - &le_x).mapv(f32::abs);
    let eye_cx = (&le_x + &re_x) / 2.0;
    let yaw = Zip::from(&nose_x)
        .and(&eye_cx)
        .and(&eye_dist)
        .map_collect(|&nx, &cx, &d| (1.0 - (nx - cx).abs() / d).max(0.0));

    let eye_y = (&le_y + &re_y) / 2.0;
    let mouth_y = (&lm_y + &rm_y) / 2.0;
    let upper = &nose_y - &eye_y;
    let lower = &mouth_y - &nose_y;
    let pitch = Zip::from(&upper).and(&lower).map_collect(|&u, &l| {
        if u > 0.0 && l > 0.0 {
            (1.0 - (u / (u + l) - ideal_balance).abs() * 4.0).max(0.0)
        } else {
            0.0
        }
    });

    let mut out = &yaw * &pitch;
    Zip::from(&mut out)
        .and(has)
        .and(&eye_dist)
        .for_each(|v, &present, &d| {
            *v = if present && d > f32::EPSILON {
                finite_or_zero(*v)
            } else {
                0.0
            };
        });
    out
}

/// 灰度 ROI 的拉普拉斯方差 (ndarray 切片实现)
fn laplacian_variance(det: &Detection) -> Option<f64> {
    let image = &det.frame.image;
    let (x0, y0, x1, y1) = pixel_roi(image, &det.bbox)?;
    let (rw, rh) = ((x1 - x0) as usize, (y1 - y0) as usize);

    let gray = Array2::from_shape_fn((rh, rw), |(r, c)| {
        luma(image.get_pixel(x0 + c as u32, y0 + r as u32))
    });

    let center = gray.slice(s![1..-1, 1..-1]);
    let lap = &gray.slice(s![1..-1, ..-2])
        + &gray.slice(s![1..-1, 2..])
        + &gray.slice(s![..-2, 1..-1])
        + &gray.slice(s![2.., 1..-1])
        - &(&center * 4.0);

    let n = lap.len() as f64;
    let mean = lap.sum() / n;
    let mean_sq = lap.mapv(|v| v * v).sum() / n;
    Some((mean_sq - mean * mean).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{checker_frame, flat_frame, frontal_landmarks};
    use super::super::QualityScorer;
    use crate::detection::types::{BBox, Detection, Frame, Landmarks};
    use image::{Rgb, RgbImage};

    fn noise_frame() -> crate::detection::types::FrameRef {
        // 确定性伪随机纹理
        let image = RgbImage::from_fn(160, 120, |x, y| {
            let v = ((x * 73 + y * 151 + x * y * 7) % 256) as u8;
            Rgb([v, v.wrapping_mul(3), v.wrapping_add(40)])
        });
        Frame::shared(1, image)
    }

    #[test]
    fn batch_matches_scalar() {
        let scorer = QualityScorer::default();
        let noisy = noise_frame();
        let checker = checker_frame(2, 200, 200);
        let flat = flat_frame(3, 64, 64);

        let mut turned = frontal_landmarks(60.0, 60.0, 60.0);
        turned.points[2].0 += 9.0;

        let detections = vec![
            Detection::new(noisy.clone(), BBox::new(30.0, 20.0, 50.0, 64.0), 0.9)
                .with_landmarks(frontal_landmarks(55.0, 52.0, 50.0)),
            Detection::new(noisy.clone(), BBox::new(0.0, 0.0, 40.0, 40.0), 0.7)
                .with_landmarks(turned),
            Detection::new(checker.clone(), BBox::new(50.0, 50.0, 0.0, 30.0), 0.8),
            Detection::new(checker.clone(), BBox::new(150.0, 170.0, 80.0, 80.0), 0.6),
            Detection::new(checker, BBox::new(10.5, 12.25, 7.5, 9.0), 0.5)
                .with_landmarks(Landmarks::new(vec![(1.0, 1.0), (2.0, 2.0)])),
            Detection::new(flat, BBox::new(8.0, 8.0, 30.0, 30.0), 0.4)
                .with_landmarks(Landmarks::new(vec![(10.0, 10.0); 5])),
        ];

        let batch = scorer.breakdown_batch(&detections);
        assert_eq!(batch.len(), detections.len());
        for (det, b) in detections.iter().zip(&batch) {
            let s = scorer.breakdown(det);
            assert_eq!(s.degenerate, b.degenerate);
            assert!((s.frontal - b.frontal).abs() < 1e-5, "{:?} vs {:?}", s, b);
            assert!((s.geometry - b.geometry).abs() < 1e-5, "{:?} vs {:?}", s, b);
            assert!((s.sharpness - b.sharpness).abs() < 1e-4, "{:?} vs {:?}", s, b);
            assert!((s.total - b.total).abs() < 1e-4, "{:?} vs {:?}", s, b);
        }
    }

    #[test]
    fn zero_area_in_batch_gets_floor() {
        let scorer = QualityScorer::default();
        let frame = checker_frame(0, 128, 128);
        let detections = vec![
            Detection::new(frame.clone(), BBox::new(30.0, 30.0, 40.0, 52.0), 0.9)
                .with_landmarks(frontal_landmarks(50.0, 56.0, 40.0)),
            Detection::new(frame, BBox::new(60.0, 60.0, 0.0, 0.0), 0.9),
        ];
        let scores = scorer.score_batch(&detections);
        assert_eq!(scores[1], super::super::MIN_SCORE);
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn far_outside_box_in_batch() {
        let scorer = QualityScorer::default();
        let frame = checker_frame(0, 64, 64);
        let detections = vec![
            Detection::new(frame.clone(), BBox::new(1.0e10, 10.0, 10.0, 10.0), 0.9),
            Detection::new(frame, BBox::new(10.0, 1.0e10, 10.0, 10.0), 0.9),
        ];
        let batch = scorer.breakdown_batch(&detections);
        for (det, b) in detections.iter().zip(&batch) {
            assert_eq!(b.sharpness, 0.0);
            assert!((scorer.breakdown(det).total - b.total).abs() < 1e-4);
        }
    }

    #[test]
    fn empty_batch() {
        assert!(QualityScorer::default().score_batch(&[]).is_empty());
    }
}
