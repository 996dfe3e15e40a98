// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 最佳帧选择与标注 (BestFrameSelector)
//!
//! 线性扫描取最高分样本, 同分取最早到达的样本; 退化样本排在所有正常样本之后.
//! 标注画在帧的副本上, 原始帧可能仍被其他轨迹引用.

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::config::MovementConfig;
use crate::detection::types::{BBox, FrameRef};
use crate::error::ScoreError;
use crate::track::{FinishReason, FinishedTrack, ScoredSample, TrackSummary};

// ========== 标注样式 (固定) ==========

/// 运动目标框颜色 (绿)
pub const MOVING_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// 静止目标框颜色 (黄)
pub const STATIC_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
/// 框线宽度
pub const STROKE_WIDTH: i32 = 2;
/// 标签文字颜色
const LABEL_TEXT: Rgb<u8> = Rgb([0, 0, 0]);
/// 字体标签字号
const LABEL_SCALE: f32 = 18.0;
/// 点阵字体放大倍数
const BITMAP_SCALE: i32 = 2;

/// 在样本序列中选出最佳样本的下标
pub fn select_best(samples: &[ScoredSample]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, sample) in samples.iter().enumerate() {
        match best {
            None => best = Some(i),
            Some(b) if beats(sample, &samples[b]) => best = Some(i),
            Some(_) => {}
        }
    }
    best
}

/// 严格更优才替换, 保证同分时保留最早的样本
fn beats(candidate: &ScoredSample, current: &ScoredSample) -> bool {
    match (candidate.degenerate, current.degenerate) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.score > current.score,
    }
}

/// 一条轨迹的最终输出
#[derive(Clone, Debug)]
pub struct BestShot {
    pub track_id: u64,
    pub score: f32,
    pub bbox: BBox,
    pub frame_seq: u64,
    pub captured_at: DateTime<Local>,
    /// 原始帧 (未标注)
    pub frame: FrameRef,
    /// 标注后的副本
    pub annotated: RgbImage,
    pub moving: bool,
    pub summary: TrackSummary,
    pub reason: FinishReason,
}

#[derive(Clone)]
pub struct BestFrameSelector {
    movement: MovementConfig,
    font: Option<FontArc>,
}

impl BestFrameSelector {
    pub fn new(movement: MovementConfig, font: Option<FontArc>) -> Self {
        Self { movement, font }
    }

    /// 加载标签字体 (TTF/OTF)
    pub fn load_font(path: &Path) -> anyhow::Result<FontArc> {
        let bytes = std::fs::read(path)?;
        Ok(FontArc::try_from_vec(bytes)?)
    }

    /// 消费一条已结束的轨迹, 产出标注后的最佳帧
    pub fn finalize(&self, track: FinishedTrack) -> Result<BestShot, ScoreError> {
        let summary = track.summary();
        let moving = track.movement().is_moving(&self.movement);
        let reason = track.reason;
        let track_id = track.id;

        let mut samples = track.samples;
        let index = select_best(&samples)
            .ok_or_else(|| ScoreError::Annotate(format!("track {} has no samples", track_id)))?;
        // 其余样本在此释放, 帧引用随之减少
        let winner = samples.swap_remove(index);
        drop(samples);

        let annotated = self.annotate(&winner, track_id, moving);
        Ok(BestShot {
            track_id,
            score: winner.score,
            bbox: *winner.bbox(),
            frame_seq: winner.frame_seq(),
            captured_at: winner.captured_at(),
            frame: winner.frame().clone(),
            annotated,
            moving,
            summary,
            reason,
        })
    }

    /// 在帧副本上画框和标签
    pub fn annotate(&self, sample: &ScoredSample, track_id: u64, moving: bool) -> RgbImage {
        let mut canvas = sample.frame().image.clone();
        let (w, h) = canvas.dimensions();
        if w == 0 || h == 0 {
            return canvas;
        }

        let color = if moving { MOVING_COLOR } else { STATIC_COLOR };
        let b = sample.bbox();
        let x0 = (b.x.max(0.0) as i32).min(w as i32 - 1);
        let y0 = (b.y.max(0.0) as i32).min(h as i32 - 1);
        let x1 = (((b.x + b.w).max(0.0)) as i32).clamp(x0, w as i32 - 1);
        let y1 = (((b.y + b.h).max(0.0)) as i32).clamp(y0, h as i32 - 1);

        for i in 0..STROKE_WIDTH {
            let rect = Rect::at(x0 - i, y0 - i)
                .of_size((x1 - x0 + 1 + 2 * i) as u32, (y1 - y0 + 1 + 2 * i) as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }

        let label = format!(
            "ID {} {:.2} {}",
            track_id,
            sample.score,
            if moving { "MOV" } else { "STATIC" }
        );
        match &self.font {
            Some(font) => draw_font_label(&mut canvas, font, &label, x0, y0, color),
            None => draw_bitmap_label(&mut canvas, &label, x0, y0, color),
        }
        canvas
    }
}

/// 标签放在框的上方, 顶部空间不足时放在框内
fn label_origin(x0: i32, y0: i32, label_h: i32) -> (i32, i32) {
    let y = if y0 - label_h - STROKE_WIDTH >= 0 {
        y0 - label_h - STROKE_WIDTH
    } else {
        y0 + STROKE_WIDTH
    };
    (x0.max(0), y)
}

fn draw_font_label(canvas: &mut RgbImage, font: &FontArc, label: &str, x0: i32, y0: i32, bg: Rgb<u8>) {
    let scale = PxScale::from(LABEL_SCALE);
    let (tw, th) = text_size(scale, font, label);
    let (lx, ly) = label_origin(x0, y0, th as i32 + 4);
    draw_filled_rect_mut(canvas, Rect::at(lx, ly).of_size(tw + 6, th + 4), bg);
    draw_text_mut(canvas, LABEL_TEXT, lx + 3, ly + 2, scale, font, label);
}

fn draw_bitmap_label(canvas: &mut RgbImage, label: &str, x0: i32, y0: i32, bg: Rgb<u8>) {
    let advance = 6 * BITMAP_SCALE;
    let glyph_h = 7 * BITMAP_SCALE;
    let tw = label.chars().count() as i32 * advance;
    let (lx, ly) = label_origin(x0, y0, glyph_h + 4);
    draw_filled_rect_mut(
        canvas,
        Rect::at(lx, ly).of_size((tw + 4) as u32, (glyph_h + 4) as u32),
        bg,
    );

    let mut x = lx + 2;
    for ch in label.chars().flat_map(char::to_uppercase) {
        if let Some(rows) = glyph_bits(ch) {
            for (row, pattern) in rows.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col * BITMAP_SCALE;
                        let py = ly + 2 + row as i32 * BITMAP_SCALE;
                        draw_filled_rect_mut(
                            canvas,
                            Rect::at(px, py).of_size(BITMAP_SCALE as u32, BITMAP_SCALE as u32),
                            LABEL_TEXT,
                        );
                    }
                }
            }
        }
        x += advance;
    }
}

/// 5x7 点阵字形 (只覆盖标签用到的字符)
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        _ => return None,
    };
    Some(rows)
}
