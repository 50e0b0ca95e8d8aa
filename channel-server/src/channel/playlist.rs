// 统一低延迟视频流传输系统 - 播放列表
//
// 每轮播放开始时重新扫描频道目录，得到本轮要播放的文件列表。

use common::SortMode;
use rand::seq::SliceRandom;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 播放列表条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub path: PathBuf,
    /// 文件名去掉扩展名
    pub title: String,
}

impl PlaylistEntry {
    pub fn new(path: PathBuf) -> Self {
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, title }
    }
}

/// 播放列表来源
pub trait PlaylistProvider: Send {
    /// 列出本轮要播放的文件
    fn enumerate(&mut self) -> io::Result<Vec<PlaylistEntry>>;
}

/// 目录播放列表
pub struct DirectoryPlaylist {
    dir: PathBuf,
    sort: SortMode,
    extensions: Vec<String>,
}

impl DirectoryPlaylist {
    /// 创建目录播放列表
    ///
    /// # 参数
    ///
    /// * `dir` - 媒体目录（只扫描一层）
    /// * `sort` - 字母序或随机
    /// * `extensions` - 接受的扩展名，不区分大小写
    pub fn new(dir: impl Into<PathBuf>, sort: SortMode, extensions: &[String]) -> Self {
        Self {
            dir: dir.into(),
            sort,
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| self.extensions.iter().any(|accepted| *accepted == ext))
            .unwrap_or(false)
    }
}

impl PlaylistProvider for DirectoryPlaylist {
    fn enumerate(&mut self) -> io::Result<Vec<PlaylistEntry>> {
        if !self.dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", self.dir.display()),
            ));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in {:?}: {}", self.dir, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                continue;
            }
            entries.push(PlaylistEntry::new(entry.into_path()));
        }

        match self.sort {
            SortMode::Alpha => entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name())),
            SortMode::Random => entries.shuffle(&mut rand::thread_rng()),
        }

        debug!("Playlist {:?}: {} entries", self.dir, entries.len());
        Ok(entries)
    }
}
