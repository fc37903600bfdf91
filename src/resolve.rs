use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{LoadError, extension_of, file_size_mb};

pub(crate) const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi"];

/// A validated video + index pair.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedMemory {
    pub(crate) video: PathBuf,
    pub(crate) index: PathBuf,
    pub(crate) index_json: serde_json::Value,
    /// Build record next to the video, when there is one.
    pub(crate) metadata: Option<PathBuf>,
    pub(crate) chunk_count: usize,
    pub(crate) video_size_mb: f64,
}

fn is_video(path: &Path) -> bool {
    VIDEO_EXTENSIONS.contains(&extension_of(path).as_str())
}

pub(crate) fn with_appended_extension(base: &Path, ext: &str) -> PathBuf {
    let mut raw: OsString = base.as_os_str().to_owned();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

fn video_candidates(path: &Path) -> Vec<PathBuf> {
    if path.is_dir() {
        let mut found: Vec<PathBuf> = match fs::read_dir(path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_video(p))
                .collect(),
            Err(_) => Vec::new(),
        };
        found.sort_by_key(|p| {
            let rank = VIDEO_EXTENSIONS
                .iter()
                .position(|ext| *ext == extension_of(p))
                .unwrap_or(VIDEO_EXTENSIONS.len());
            (rank, p.clone())
        });
        return found;
    }
    if path.is_file() && is_video(path) {
        return vec![path.to_path_buf()];
    }
    VIDEO_EXTENSIONS
        .iter()
        .map(|ext| with_appended_extension(path, ext))
        .filter(|p| p.is_file())
        .collect()
}

/// Index file names tried for a video, in order.
pub(crate) fn index_candidates(video: &Path) -> Vec<PathBuf> {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = video.parent().unwrap_or_else(|| Path::new(""));
    let mut out = vec![
        parent.join(format!("{stem}_index.json")),
        video.with_extension("json"),
    ];
    out.dedup();
    out
}

fn metadata_for(video: &Path) -> Option<PathBuf> {
    let stem = video.file_stem()?.to_string_lossy().into_owned();
    let parent = video.parent().unwrap_or_else(|| Path::new(""));
    Some(parent.join(format!("{stem}_metadata.json"))).filter(|p| p.is_file())
}

fn find_index(video: &Path) -> Option<PathBuf> {
    index_candidates(video).into_iter().find(|p| p.is_file())
}

/// Locates the memory at `path` (a directory, a video file, or a base name
/// without extension) and checks that its index parses.
pub(crate) fn resolve_existing(path: &Path) -> Result<ResolvedMemory, LoadError> {
    let videos = video_candidates(path);
    let Some(first) = videos.first() else {
        return Err(LoadError::VideoNotFound(path.to_path_buf()));
    };

    let (video, index) = videos
        .iter()
        .find_map(|v| find_index(v).map(|i| (v.clone(), i)))
        .ok_or_else(|| LoadError::IndexNotFound(first.clone()))?;

    let index_json = read_index(&index)?;
    let chunk_count = index_json
        .get("metadata")
        .and_then(|m| m.as_array())
        .map(|m| m.len())
        .unwrap_or(0);
    let video_size_mb = file_size_mb(&video);
    let metadata = metadata_for(&video);

    Ok(ResolvedMemory {
        video,
        index,
        index_json,
        metadata,
        chunk_count,
        video_size_mb,
    })
}

pub(crate) fn read_index(path: &Path) -> Result<serde_json::Value, LoadError> {
    let data = fs::read_to_string(path).map_err(|e| LoadError::IndexCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&data).map_err(|e| LoadError::IndexCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
