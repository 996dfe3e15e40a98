// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 演示用检测器: 不加载模型, 按固定种子生成移动的人脸
//!
//! 每个摄像头维护独立的场景 (人脸列表 + 跟踪ID计数), 与真实跟踪器一样按 `camera_id` 隔离.
//! 人脸会随机出现, 移动, 转头, 偶尔漏检, 寿命结束后离开画面.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detection::{BBox, Detection, Detector, FrameRef, Landmarks};

/// 模拟的人脸
#[derive(Clone, Debug)]
struct SimFace {
    track_id: u64,
    cx: f32,
    cy: f32,
    size: f32,
    vx: f32,
    vy: f32,
    /// 偏航 [-1, 1], 0 为正脸
    yaw: f32,
    yaw_rate: f32,
    remaining: u32,
}

impl SimFace {
    fn step(&mut self) {
        self.cx += self.vx;
        self.cy += self.vy;
        self.yaw = (self.yaw + self.yaw_rate).clamp(-1.0, 1.0);
        if self.yaw.abs() >= 1.0 {
            self.yaw_rate = -self.yaw_rate;
        }
        self.remaining = self.remaining.saturating_sub(1);
    }

    fn bbox(&self) -> BBox {
        let w = self.size;
        let h = self.size * 1.3;
        BBox::new(self.cx - w / 2.0, self.cy - h / 2.0, w, h)
    }

    /// 五点关键点: 左眼, 右眼, 鼻尖, 左嘴角, 右嘴角; 偏航使鼻尖水平偏移
    fn landmarks(&self) -> Landmarks {
        let s = self.size / 4.0;
        let (cx, cy) = (self.cx, self.cy);
        Landmarks::new(vec![
            (cx - s, cy - s),
            (cx + s, cy - s),
            (cx + self.yaw * s * 1.5, cy),
            (cx - s * 0.8, cy + s),
            (cx + s * 0.8, cy + s),
        ])
    }
}

/// 单个摄像头的场景
struct Scene {
    rng: StdRng,
    faces: Vec<SimFace>,
    next_id: u64,
}

impl Scene {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            faces: Vec::new(),
            next_id: 1,
        }
    }

    fn spawn(&mut self, width: f32, height: f32) {
        let size = self.rng.gen_range(0.08f32..0.2) * width.min(height) * 2.0;
        let face = SimFace {
            track_id: self.next_id,
            cx: self.rng.gen_range(size..(width - size).max(size + 1.0)),
            cy: self.rng.gen_range(size..(height - size).max(size + 1.0)),
            size,
            vx: self.rng.gen_range(-4.0..4.0),
            vy: self.rng.gen_range(-2.0..2.0),
            yaw: self.rng.gen_range(-1.0..1.0),
            yaw_rate: self.rng.gen_range(-0.1..0.1),
            remaining: self.rng.gen_range(20..120),
        };
        self.next_id += 1;
        self.faces.push(face);
    }

    fn advance(&mut self, frame: &FrameRef, max_faces: usize, miss_rate: f64) -> Vec<Detection> {
        let (w, h) = (frame.width() as f32, frame.height() as f32);

        for face in &mut self.faces {
            face.step();
        }
        self.faces
            .retain(|f| f.remaining > 0 && f.cx > 0.0 && f.cy > 0.0 && f.cx < w && f.cy < h);
        if self.faces.len() < max_faces && self.rng.gen_bool(0.1) {
            self.spawn(w, h);
        }

        let mut detections = Vec::with_capacity(self.faces.len());
        for face in &self.faces {
            if self.rng.gen_bool(miss_rate) {
                continue;
            }
            let confidence = self.rng.gen_range(0.6..0.99);
            detections.push(
                Detection::new(frame.clone(), face.bbox(), confidence)
                    .with_track(face.track_id)
                    .with_landmarks(face.landmarks()),
            );
        }
        detections
    }
}

/// 合成检测器 + 跟踪器
pub struct SyntheticDetector {
    seed: u64,
    max_faces: usize,
    miss_rate: f64,
    scenes: HashMap<u32, Scene>,
}

impl SyntheticDetector {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_faces: 4,
            miss_rate: 0.05,
            scenes: HashMap::new(),
        }
    }

    pub fn with_max_faces(mut self, max_faces: usize) -> Self {
        self.max_faces = max_faces;
        self
    }

    /// 单帧漏检概率, 用于制造短暂丢失
    pub fn with_miss_rate(mut self, miss_rate: f64) -> Self {
        self.miss_rate = miss_rate.clamp(0.0, 1.0);
        self
    }
}

impl Detector for SyntheticDetector {
    fn detect(&mut self, camera_id: u32, frames: &[FrameRef]) -> anyhow::Result<Vec<Vec<Detection>>> {
        let (max_faces, miss_rate) = (self.max_faces, self.miss_rate);
        let seed = self.seed ^ (camera_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let scene = self.scenes.entry(camera_id).or_insert_with(|| Scene::new(seed));
        Ok(frames
            .iter()
            .map(|frame| scene.advance(frame, max_faces, miss_rate))
            .collect())
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Frame;
    use image::RgbImage;

    fn frames(n: u64) -> Vec<FrameRef> {
        (0..n).map(|i| Frame::shared(i, RgbImage::new(320, 240))).collect()
    }

    fn tracks(detector: &mut SyntheticDetector, camera: u32) -> Vec<Vec<u64>> {
        detector
            .detect(camera, &frames(200))
            .unwrap()
            .into_iter()
            .map(|ds| ds.iter().filter_map(|d| d.track_id).collect())
            .collect()
    }

    #[test]
    fn same_seed_same_scene() {
        let a = tracks(&mut SyntheticDetector::new(42), 1);
        let b = tracks(&mut SyntheticDetector::new(42), 1);
        assert_eq!(a, b);
        assert!(a.iter().any(|ids| !ids.is_empty()));
    }

    #[test]
    fn cameras_have_independent_ids() {
        let mut detector = SyntheticDetector::new(7).with_max_faces(2);
        let cam1 = tracks(&mut detector, 1);
        let cam2 = tracks(&mut detector, 2);
        // 两路画面都从 1 开始分配ID
        assert_eq!(cam1.iter().flatten().min(), Some(&1));
        assert_eq!(cam2.iter().flatten().min(), Some(&1));
        assert!(cam1.iter().all(|ids| ids.len() <= 2));
    }

    #[test]
    fn detections_carry_landmarks_inside_frame() {
        let mut detector = SyntheticDetector::new(3).with_miss_rate(0.0);
        for ds in detector.detect(5, &frames(100)).unwrap() {
            for d in ds {
                assert!(d.landmarks.as_ref().and_then(Landmarks::five_point).is_some());
                let (cx, cy) = d.bbox.center();
                assert!(cx > 0.0 && cy > 0.0 && cx < 320.0 && cy < 240.0);
            }
        }
    }
}
