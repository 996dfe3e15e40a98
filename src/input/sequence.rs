// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 图片目录回放: 按文件名排序依次输出 JPEG/PNG

use std::path::PathBuf;

use image::RgbImage;
use tracing::{info, warn};

use super::FrameSource;
use crate::error::SourceError;

const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub struct SequenceSource {
    address: String,
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    connected: bool,
}

impl SequenceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            address: dir.display().to_string(),
            dir,
            files: Vec::new(),
            cursor: 0,
            connected: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.files.len().saturating_sub(self.cursor)
    }
}

impl FrameSource for SequenceSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| SourceError::Connect {
            address: self.address.clone(),
            reason: e.to_string(),
        })?;

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        // 重连后从上次位置继续
        if self.files.is_empty() {
            info!("📂 图片序列: {} 张 ({})", files.len(), self.address);
        }
        self.files = files;
        self.connected = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected {
                address: self.address.clone(),
            });
        }
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        match image::open(path) {
            Ok(img) => Ok(Some(img.to_rgb8())),
            Err(e) => {
                warn!("⚠️ 无法解码 {}: {}", path.display(), e);
                Err(SourceError::Read {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn plays_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
            RgbImage::from_pixel(4, 3, Rgb([shade, shade, shade]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("readme.txt"), b"skip").unwrap();

        let mut source = SequenceSource::new(dir.path());
        assert!(matches!(source.read(), Err(SourceError::NotConnected { .. })));
        source.connect().unwrap();
        assert_eq!(source.remaining(), 3);

        let shades: Vec<u8> = std::iter::from_fn(|| source.read().unwrap())
            .map(|img| img.get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![10, 20, 30]);
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_read_error_and_playback_continues() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"not a jpeg").unwrap();
        RgbImage::new(2, 2).save(dir.path().join("b.png")).unwrap();

        let mut source = SequenceSource::new(dir.path());
        source.connect().unwrap();
        assert!(matches!(source.read(), Err(SourceError::Read { .. })));
        source.disconnect();
        source.connect().unwrap();
        assert!(source.read().unwrap().is_some());
    }

    #[test]
    fn missing_directory_fails_to_connect() {
        let mut source = SequenceSource::new("/no/such/dir/for/frames");
        assert!(matches!(source.connect(), Err(SourceError::Connect { .. })));
    }
}
