// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 合成画面输入 (演示/测试用)
//!
//! 地址格式: `synthetic://WIDTHxHEIGHT?frames=N&fail_every=K`
//! - frames: 输出 N 帧后流结束, 省略时无限输出
//! - fail_every: 每 K 帧模拟一次读取失败 (测试重连)

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::FrameSource;
use crate::error::SourceError;

pub struct SyntheticSource {
    address: String,
    width: u32,
    height: u32,
    frames: Option<u64>,
    fail_every: Option<u64>,
    produced: u64,
    connected: bool,
    rng: StdRng,
    background: RgbImage,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frames: Option<u64>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let background = RgbImage::from_fn(width, height, |_, _| {
            let v: u8 = rng.gen_range(40..200);
            Rgb([v, v.saturating_add(10), v.saturating_sub(10)])
        });
        Self {
            address: format!("synthetic://{}x{}", width, height),
            width,
            height,
            frames,
            fail_every: None,
            produced: 0,
            connected: false,
            rng,
            background,
        }
    }

    pub fn with_failures(mut self, every: u64) -> Self {
        self.fail_every = Some(every).filter(|n| *n > 0);
        self
    }

    /// 解析 `synthetic://WxH?frames=N&fail_every=K`
    pub fn parse(address: &str, seed: u64) -> anyhow::Result<Self> {
        let rest = address
            .strip_prefix("synthetic://")
            .ok_or_else(|| anyhow::anyhow!("not a synthetic address: {}", address))?;
        let (size, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (w, h) = size
            .split_once('x')
            .ok_or_else(|| anyhow::anyhow!("expected WIDTHxHEIGHT in {}", address))?;
        let (width, height): (u32, u32) = (w.parse()?, h.parse()?);
        anyhow::ensure!(width >= 16 && height >= 16, "synthetic frame too small: {}", size);

        let mut frames = None;
        let mut fail_every = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("frames", v)) => frames = Some(v.parse()?),
                Some(("fail_every", v)) => fail_every = Some(v.parse()?),
                _ => anyhow::bail!("unknown synthetic option `{}`", pair),
            }
        }

        let mut source = Self::new(width, height, frames, seed);
        if let Some(k) = fail_every {
            source = source.with_failures(k);
        }
        source.address = address.to_string();
        Ok(source)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl FrameSource for SyntheticSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        self.connected = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected {
                address: self.address.clone(),
            });
        }
        if self.frames.is_some_and(|n| self.produced >= n) {
            return Ok(None);
        }
        self.produced += 1;

        if let Some(k) = self.fail_every {
            if self.produced % k == 0 {
                self.connected = false;
                return Err(SourceError::Read {
                    address: self.address.clone(),
                    reason: format!("simulated drop at frame {}", self.produced),
                });
            }
        }

        // 背景纹理 + 少量噪声
        let mut frame = self.background.clone();
        for _ in 0..(self.width * self.height / 64) {
            let x = self.rng.gen_range(0..self.width);
            let y = self.rng.gen_range(0..self.height);
            let v: u8 = self.rng.gen();
            frame.put_pixel(x, y, Rgb([v, v, v]));
        }
        Ok(Some(frame))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options() {
        let source = SyntheticSource::parse("synthetic://320x240?frames=5&fail_every=2", 1).unwrap();
        assert_eq!(source.dimensions(), (320, 240));
        assert_eq!(source.frames, Some(5));
        assert_eq!(source.fail_every, Some(2));
        assert!(SyntheticSource::parse("synthetic://320", 1).is_err());
        assert!(SyntheticSource::parse("synthetic://8x8", 1).is_err());
        assert!(SyntheticSource::parse("synthetic://64x64?speed=3", 1).is_err());
    }

    #[test]
    fn ends_after_frame_count() {
        let mut source = SyntheticSource::new(32, 32, Some(3), 7);
        source.connect().unwrap();
        for _ in 0..3 {
            let frame = source.read().unwrap().unwrap();
            assert_eq!(frame.dimensions(), (32, 32));
        }
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn simulated_failures_require_reconnect() {
        let mut source = SyntheticSource::new(32, 32, None, 7).with_failures(2);
        source.connect().unwrap();
        assert!(source.read().unwrap().is_some());
        assert!(matches!(source.read(), Err(SourceError::Read { .. })));
        assert!(matches!(source.read(), Err(SourceError::NotConnected { .. })));
        source.connect().unwrap();
        assert!(source.read().unwrap().is_some());
    }
}
