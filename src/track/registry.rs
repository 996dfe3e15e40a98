// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 轨迹注册表 (TrackRegistry)
//!
//! 每处理一帧调用一次 [`TrackRegistry::update`]:
//! 1. 新ID → 创建轨迹; 已知ID → 追加样本并重置丢失计数
//! 2. 本帧未匹配的轨迹丢失计数 +1, 达到阈值即结束
//! 3. 超过活跃轨迹上限时结束最久未匹配的轨迹
//!
//! 结束的轨迹从注册表移除后按值返回, 同一ID之后再出现会创建新的轨迹.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::buffer::{FinishReason, FinishedTrack, ScoredSample, Track};
use crate::config::{SampleOverflow, TrackingConfig};

pub struct TrackRegistry {
    tracks: BTreeMap<u64, Track>,
    config: TrackingConfig,
    created: u64,
    finished: u64,
}

impl TrackRegistry {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            tracks: BTreeMap::new(),
            config,
            created: 0,
            finished: 0,
        }
    }

    /// 活跃轨迹数
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn finished(&self) -> u64 {
        self.finished
    }

    /// 登记一帧的已评分样本, 返回本帧结束的轨迹 (按ID升序)
    pub fn update(&mut self, frame_seq: u64, samples: Vec<ScoredSample>) -> Vec<FinishedTrack> {
        let mut matched = HashSet::with_capacity(samples.len());
        let mut finished = Vec::new();

        for sample in samples {
            let Some(id) = sample.track_id() else {
                warn!(frame = frame_seq, "⚠️ 未关联跟踪ID的样本被忽略");
                continue;
            };

            let track = self.tracks.entry(id).or_insert_with(|| {
                debug!(track = id, frame = frame_seq, "🆕 新轨迹");
                self.created += 1;
                Track::new(id, frame_seq)
            });

            if track.len() >= self.config.max_samples_per_track
                && self.config.sample_overflow == SampleOverflow::EvictOldest
            {
                track.evict_oldest();
            }
            track.push(sample);
            matched.insert(id);

            if self.config.sample_overflow == SampleOverflow::FinalizeEarly
                && track.len() >= self.config.max_samples_per_track
            {
                if let Some(track) = self.tracks.remove(&id) {
                    debug!(track = id, frame = frame_seq, "✂️ 样本数达到上限, 提前结束");
                    finished.push(track.finish(FinishReason::SampleCap));
                }
            }
        }

        // 未匹配轨迹丢失计数 +1
        let threshold = self.config.max_frames_lost;
        let mut lost = Vec::new();
        for (id, track) in self.tracks.iter_mut() {
            if !matched.contains(id) && track.mark_lost() >= threshold {
                lost.push(*id);
            }
        }
        for id in lost {
            if let Some(track) = self.tracks.remove(&id) {
                debug!(track = id, frame = frame_seq, "👋 轨迹丢失 {} 帧, 结束", threshold);
                finished.push(track.finish(FinishReason::Lost));
            }
        }

        // 活跃轨迹上限
        while self.tracks.len() > self.config.max_active_tracks {
            let stalest = self
                .tracks
                .values()
                .max_by(|a, b| a.frames_lost().cmp(&b.frames_lost()).then(b.id().cmp(&a.id())))
                .map(Track::id);
            let Some(id) = stalest else { break };
            if let Some(track) = self.tracks.remove(&id) {
                warn!(track = id, "⚠️ 活跃轨迹超过上限 {}, 强制结束", self.config.max_active_tracks);
                finished.push(track.finish(FinishReason::TrackCap));
            }
        }

        finished.sort_by_key(|t| t.id);
        self.finished += finished.len() as u64;
        finished
    }

    /// 关闭时强制结束全部活跃轨迹
    pub fn finish_all(&mut self) -> Vec<FinishedTrack> {
        let tracks = std::mem::take(&mut self.tracks);
        let finished: Vec<FinishedTrack> = tracks
            .into_values()
            .map(|t| t.finish(FinishReason::Shutdown))
            .collect();
        self.finished += finished.len() as u64;
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, Detection, Frame};
    use image::RgbImage;

    fn config(max_frames_lost: u32) -> TrackingConfig {
        TrackingConfig {
            max_frames_lost,
            ..Default::default()
        }
    }

    fn sample(seq: u64, id: u64, score: f32) -> ScoredSample {
        let frame = Frame::shared(seq, RgbImage::new(4, 4));
        ScoredSample::new(
            Detection::new(frame, BBox::new(1.0, 1.0, 2.0, 2.0), 0.9).with_track(id),
            score,
        )
    }

    #[test]
    fn finishes_exactly_at_threshold() {
        let mut registry = TrackRegistry::new(config(3));
        assert!(registry.update(0, vec![sample(0, 5, 0.5)]).is_empty());
        assert!(registry.update(1, vec![]).is_empty());
        assert!(registry.update(2, vec![]).is_empty());
        assert_eq!(registry.get(5).unwrap().frames_lost(), 2);

        let finished = registry.update(3, vec![]);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, 5);
        assert_eq!(finished[0].reason, FinishReason::Lost);
        assert!(registry.is_empty());
    }

    #[test]
    fn match_before_threshold_resets() {
        let mut registry = TrackRegistry::new(config(3));
        registry.update(0, vec![sample(0, 1, 0.5)]);
        registry.update(1, vec![]);
        registry.update(2, vec![]);
        // 丢失计数 = 阈值 - 1 时再次匹配
        assert!(registry.update(3, vec![sample(3, 1, 0.7)]).is_empty());
        assert_eq!(registry.get(1).unwrap().frames_lost(), 0);
        assert_eq!(registry.get(1).unwrap().len(), 2);
        assert!(registry.update(4, vec![]).is_empty());
        assert!(registry.update(5, vec![]).is_empty());
        assert_eq!(registry.update(6, vec![]).len(), 1);
    }

    #[test]
    fn new_track_is_not_counted_lost_in_its_first_frame() {
        let mut registry = TrackRegistry::new(config(1));
        assert!(registry.update(0, vec![sample(0, 1, 0.5)]).is_empty());
        assert_eq!(registry.update(1, vec![]).len(), 1);
    }

    #[test]
    fn shutdown_finishes_each_track_once() {
        let mut registry = TrackRegistry::new(config(10));
        registry.update(0, vec![sample(0, 3, 0.1), sample(0, 1, 0.2), sample(0, 2, 0.3)]);
        let finished = registry.finish_all();
        let ids: Vec<u64> = finished.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(finished.iter().all(|t| t.reason == FinishReason::Shutdown));
        assert!(registry.finish_all().is_empty());
        assert_eq!(registry.finished(), 3);
        assert_eq!(registry.created(), 3);
    }

    #[test]
    fn id_reused_after_finish_creates_new_track() {
        let mut registry = TrackRegistry::new(config(1));
        registry.update(0, vec![sample(0, 9, 0.5)]);
        let first = registry.update(1, vec![]);
        assert_eq!(first.len(), 1);
        registry.update(2, vec![sample(2, 9, 0.8)]);
        let track = registry.get(9).unwrap();
        assert_eq!(track.len(), 1);
        assert_eq!(registry.created(), 2);
    }

    #[test]
    fn unassociated_samples_are_ignored() {
        let mut registry = TrackRegistry::new(config(3));
        let frame = Frame::shared(0, RgbImage::new(4, 4));
        let orphan = ScoredSample::new(Detection::new(frame, BBox::new(0.0, 0.0, 2.0, 2.0), 0.9), 0.5);
        registry.update(0, vec![orphan]);
        assert!(registry.is_empty());
    }

    #[test]
    fn sample_cap_evicts_oldest() {
        let mut registry = TrackRegistry::new(TrackingConfig {
            max_samples_per_track: 3,
            sample_overflow: SampleOverflow::EvictOldest,
            ..config(5)
        });
        for seq in 0..5 {
            assert!(registry.update(seq, vec![sample(seq, 1, 0.5)]).is_empty());
        }
        let track = registry.get(1).unwrap();
        assert_eq!(track.len(), 3);
        let seqs: Vec<u64> = track.samples().map(|s| s.frame_seq()).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn sample_cap_finalizes_early() {
        let mut registry = TrackRegistry::new(TrackingConfig {
            max_samples_per_track: 2,
            sample_overflow: SampleOverflow::FinalizeEarly,
            ..config(5)
        });
        assert!(registry.update(0, vec![sample(0, 1, 0.5)]).is_empty());
        let finished = registry.update(1, vec![sample(1, 1, 0.6)]);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].reason, FinishReason::SampleCap);
        assert_eq!(finished[0].samples.len(), 2);
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn track_cap_finishes_stalest() {
        let mut registry = TrackRegistry::new(TrackingConfig {
            max_active_tracks: 2,
            ..config(10)
        });
        registry.update(0, vec![sample(0, 1, 0.5), sample(0, 2, 0.5)]);
        registry.update(1, vec![sample(1, 2, 0.5)]);
        // 轨迹1已丢失1帧, 新增轨迹3后超过上限
        let finished = registry.update(2, vec![sample(2, 2, 0.5), sample(2, 3, 0.5)]);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, 1);
        assert_eq!(finished[0].reason, FinishReason::TrackCap);
        assert_eq!(registry.len(), 2);
    }
}
