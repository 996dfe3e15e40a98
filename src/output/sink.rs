// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 输出持久化 (Output sink)
//!
//! 每条结束的轨迹输出一张JPEG, 文件名由摄像头ID, 摄像头名称, 跟踪ID和获胜帧的采集时间确定:
//! `Camera_{id}-{name}_Track_{track}_{YYYYmmdd_HHMMSS_mmm}.jpg`

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use tracing::{info, warn};

use super::selector::BestShot;
use crate::config::CameraConfig;
use crate::error::PersistError;

/// 输出端: 持久化一张最佳帧, 返回写入位置
pub trait OutputSink: Send + Sync {
    fn persist(&self, camera: &CameraConfig, shot: &BestShot) -> Result<PathBuf, PersistError>;
}

/// 生成确定性的输出文件名
pub fn artifact_name(camera: &CameraConfig, track_id: u64, captured_at: &DateTime<Local>) -> String {
    format!(
        "Camera_{}-{}_Track_{}_{}.jpg",
        camera.id,
        sanitize_name(&camera.name),
        track_id,
        captured_at.format("%Y%m%d_%H%M%S_%3f")
    )
}

/// 摄像头名称转为文件名安全的形式: 非字母数字字符合并为单个下划线
fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() || c == '-' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_');
    if out.is_empty() {
        "camera".to_string()
    } else {
        out.to_string()
    }
}

/// JPEG 目录输出
pub struct JpegDirectorySink {
    dir: PathBuf,
    quality: u8,
}

impl JpegDirectorySink {
    /// 创建输出目录 (已存在时直接使用)
    pub fn new(dir: impl Into<PathBuf>, quality: u8) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::Directory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            quality: quality.clamp(1, 100),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 删除目录中已有的 .jpg 文件, 返回删除数量
    pub fn clear_existing(&self) -> Result<usize, PersistError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| PersistError::Directory {
            path: self.dir.clone(),
            source,
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_jpg = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("jpg"))
                .unwrap_or(false);
            if !is_jpg {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("⚠️ 无法删除 {}: {}", path.display(), e),
            }
        }
        info!("🧹 已清理 {} 个旧输出文件 ({})", removed, self.dir.display());
        Ok(removed)
    }
}

impl JpegDirectorySink {
    fn encode(&self, shot: &BestShot, path: &Path, partial: &Path) -> Result<(), PersistError> {
        let write_err = |source| PersistError::Write {
            path: partial.to_path_buf(),
            source,
        };
        let file = File::create(partial).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, self.quality);
        shot.annotated
            .write_with_encoder(encoder)
            .map_err(|source| PersistError::Encode {
                path: path.to_path_buf(),
                source,
            })?;
        writer.flush().map_err(write_err)
    }
}

impl OutputSink for JpegDirectorySink {
    fn persist(&self, camera: &CameraConfig, shot: &BestShot) -> Result<PathBuf, PersistError> {
        let path = self
            .dir
            .join(artifact_name(camera, shot.track_id, &shot.captured_at));
        // 先写临时文件再改名, 读者不会看到写了一半的文件
        let partial = path.with_extension("jpg.part");

        if let Err(e) = self.encode(shot, &path, &partial) {
            // 半成品不留在输出目录
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("⚠️ 无法删除临时文件 {}: {}", partial.display(), rm);
                }
            }
            return Err(e);
        }

        fs::rename(&partial, &path).map_err(|source| PersistError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
