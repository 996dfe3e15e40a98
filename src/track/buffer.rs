// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 轨迹样本缓冲
//! Per-track evidence: scored samples, lifecycle counters and movement statistics

use std::collections::VecDeque;

use chrono::{DateTime, Local};

use crate::config::MovementConfig;
use crate::detection::types::{BBox, Detection, FrameRef};
use crate::quality::{QualityBreakdown, MIN_SCORE};

/// 单步位移超过该值 (像素) 视为运动
const STEP_MOVE_PX: f32 = 5.0;

// ========== 样本 ==========

/// 已评分样本, 评分后不再修改
#[derive(Clone, Debug)]
pub struct ScoredSample {
    pub detection: Detection,
    pub score: f32,
    /// 退化输入或评分失败, 选帧时排在所有正常样本之后
    pub degenerate: bool,
}

impl ScoredSample {
    pub fn new(detection: Detection, score: f32) -> Self {
        Self {
            detection,
            score,
            degenerate: false,
        }
    }

    pub fn from_breakdown(detection: Detection, breakdown: &QualityBreakdown) -> Self {
        Self {
            detection,
            score: breakdown.total,
            degenerate: breakdown.degenerate,
        }
    }

    /// 评分失败的样本: 最低分并标记为退化
    pub fn failed(detection: Detection) -> Self {
        Self {
            detection,
            score: MIN_SCORE,
            degenerate: true,
        }
    }

    pub fn track_id(&self) -> Option<u64> {
        self.detection.track_id
    }

    pub fn frame(&self) -> &FrameRef {
        &self.detection.frame
    }

    pub fn frame_seq(&self) -> u64 {
        self.detection.frame.seq
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.detection.frame.captured_at
    }

    pub fn bbox(&self) -> &BBox {
        &self.detection.bbox
    }
}

// ========== 活跃轨迹 ==========

/// 活跃轨迹 (只属于一个摄像头的 TrackRegistry)
#[derive(Debug)]
pub struct Track {
    id: u64,
    samples: VecDeque<ScoredSample>,
    /// 连续未匹配帧数
    frames_lost: u32,
    created_at: DateTime<Local>,
    first_seq: u64,
    last_seq: u64,
    evicted: usize,
}

impl Track {
    pub(crate) fn new(id: u64, first_seq: u64) -> Self {
        Self {
            id,
            samples: VecDeque::new(),
            frames_lost: 0,
            created_at: Local::now(),
            first_seq,
            last_seq: first_seq,
            evicted: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn frames_lost(&self) -> u32 {
        self.frames_lost
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn samples(&self) -> impl Iterator<Item = &ScoredSample> {
        self.samples.iter()
    }

    /// 追加样本并重置丢失计数
    pub(crate) fn push(&mut self, sample: ScoredSample) {
        self.last_seq = sample.frame_seq();
        self.samples.push_back(sample);
        self.frames_lost = 0;
    }

    /// 丢弃最早的样本 (同时释放其帧引用)
    pub(crate) fn evict_oldest(&mut self) -> Option<ScoredSample> {
        let sample = self.samples.pop_front()?;
        self.evicted += 1;
        if let Some(next) = self.samples.front() {
            self.first_seq = next.frame_seq();
        }
        Some(sample)
    }

    pub(crate) fn mark_lost(&mut self) -> u32 {
        self.frames_lost += 1;
        self.frames_lost
    }

    pub(crate) fn finish(self, reason: FinishReason) -> FinishedTrack {
        FinishedTrack {
            id: self.id,
            samples: self.samples.into(),
            created_at: self.created_at,
            first_seq: self.first_seq,
            last_seq: self.last_seq,
            evicted: self.evicted,
            reason,
        }
    }
}

// ========== 已结束轨迹 ==========

/// 轨迹结束原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// 连续丢失帧数达到阈值
    Lost,
    /// 管线关闭, 强制结束
    Shutdown,
    /// 样本数达到上限, 提前结束
    SampleCap,
    /// 活跃轨迹数超限, 结束最久未匹配的轨迹
    TrackCap,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lost => "lost",
            Self::Shutdown => "shutdown",
            Self::SampleCap => "sample_cap",
            Self::TrackCap => "track_cap",
        }
    }
}

/// 已结束的轨迹: 只交给选帧器一次, 按值消费
#[derive(Debug)]
pub struct FinishedTrack {
    pub id: u64,
    pub samples: Vec<ScoredSample>,
    pub created_at: DateTime<Local>,
    pub first_seq: u64,
    pub last_seq: u64,
    /// 因样本上限被丢弃的样本数
    pub evicted: usize,
    pub reason: FinishReason,
}

impl FinishedTrack {
    pub fn summary(&self) -> TrackSummary {
        let n = self.samples.len().max(1) as f32;
        TrackSummary {
            samples: self.samples.len(),
            avg_confidence: self.samples.iter().map(|s| s.detection.confidence).sum::<f32>() / n,
            avg_quality: self.samples.iter().map(|s| s.score).sum::<f32>() / n,
            first_seq: self.first_seq,
            last_seq: self.last_seq,
        }
    }

    pub fn movement(&self) -> MovementStats {
        MovementStats::from_boxes(self.samples.iter().map(|s| s.bbox()))
    }
}

/// 轨迹统计
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackSummary {
    pub samples: usize,
    pub avg_confidence: f32,
    pub avg_quality: f32,
    pub first_seq: u64,
    pub last_seq: u64,
}

// ========== 运动分析 ==========

/// 轨迹中心点运动统计
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MovementStats {
    /// 首尾中心点距离
    pub displacement: f32,
    /// 离起点的最大距离
    pub max_displacement: f32,
    /// 相邻样本位移超过阈值的比例
    pub moving_fraction: f32,
}

impl MovementStats {
    pub fn from_boxes<'a>(boxes: impl Iterator<Item = &'a BBox>) -> Self {
        let centers: Vec<(f32, f32)> = boxes.map(BBox::center).collect();
        let (Some(first), Some(last)) = (centers.first(), centers.last()) else {
            return Self::default();
        };
        if centers.len() < 2 {
            return Self::default();
        }

        let dist = |a: &(f32, f32), b: &(f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
        let displacement = dist(first, last);
        let max_displacement = centers.iter().map(|c| dist(first, c)).fold(0.0, f32::max);
        let moving_steps = centers
            .windows(2)
            .filter(|w| dist(&w[0], &w[1]) > STEP_MOVE_PX)
            .count();

        Self {
            displacement,
            max_displacement,
            moving_fraction: moving_steps as f32 / (centers.len() - 1) as f32,
        }
    }

    pub fn is_moving(&self, config: &MovementConfig) -> bool {
        let far_enough = self.displacement >= config.min_displacement_px
            || self.max_displacement >= config.min_displacement_px;
        far_enough && self.moving_fraction >= config.min_moving_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::Frame;
    use image::RgbImage;

    fn sample_at(seq: u64, x: f32, score: f32) -> ScoredSample {
        let frame = Frame::shared(seq, RgbImage::new(4, 4));
        ScoredSample::new(
            Detection::new(frame, BBox::new(x, 10.0, 20.0, 20.0), 0.8).with_track(1),
            score,
        )
    }

    #[test]
    fn push_resets_lost_counter() {
        let mut track = Track::new(1, 0);
        track.push(sample_at(0, 0.0, 0.5));
        assert_eq!(track.mark_lost(), 1);
        assert_eq!(track.mark_lost(), 2);
        track.push(sample_at(3, 0.0, 0.5));
        assert_eq!(track.frames_lost(), 0);
        assert_eq!(track.len(), 2);
    }

    #[test]
    fn eviction_advances_first_seq() {
        let mut track = Track::new(1, 0);
        for seq in 0..3 {
            track.push(sample_at(seq, 0.0, 0.5));
        }
        let dropped = track.evict_oldest().unwrap();
        assert_eq!(dropped.frame_seq(), 0);
        let finished = track.finish(FinishReason::Lost);
        assert_eq!(finished.first_seq, 1);
        assert_eq!(finished.last_seq, 2);
        assert_eq!(finished.evicted, 1);
        assert_eq!(finished.samples.len(), 2);
    }

    #[test]
    fn summary_averages() {
        let mut track = Track::new(1, 0);
        track.push(sample_at(0, 0.0, 0.2));
        track.push(sample_at(1, 0.0, 0.6));
        let summary = track.finish(FinishReason::Shutdown).summary();
        assert_eq!(summary.samples, 2);
        assert!((summary.avg_quality - 0.4).abs() < 1e-6);
        assert!((summary.avg_confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn movement_detection() {
        let config = MovementConfig::default();

        let mut walking = Track::new(1, 0);
        for (i, x) in [0.0, 20.0, 40.0, 60.0, 80.0].into_iter().enumerate() {
            walking.push(sample_at(i as u64, x, 0.5));
        }
        let stats = walking.finish(FinishReason::Lost).movement();
        assert_eq!(stats.displacement, 80.0);
        assert_eq!(stats.moving_fraction, 1.0);
        assert!(stats.is_moving(&config));

        let mut standing = Track::new(2, 0);
        for (i, x) in [0.0, 1.0, 0.0, 2.0].into_iter().enumerate() {
            standing.push(sample_at(i as u64, x, 0.5));
        }
        let stats = standing.finish(FinishReason::Lost).movement();
        assert!(!stats.is_moving(&config));

        let single = MovementStats::from_boxes([BBox::new(0.0, 0.0, 5.0, 5.0)].iter());
        assert_eq!(single, MovementStats::default());
    }
}
