use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildStats, FileRange, IndexType, MemoryConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ProcessingStats {
    pub(crate) files_processed: usize,
    pub(crate) files_skipped: usize,
    /// Seconds spent extracting and chunking.
    pub(crate) processing_time: f64,
    /// Seconds spent in the encoder, fallback included.
    pub(crate) encoding_time: f64,
    pub(crate) total_time: f64,
}

/// Written once after a successful build and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BuildRecord {
    pub(crate) created: DateTime<Utc>,
    pub(crate) source_files: Vec<String>,
    pub(crate) video_path: PathBuf,
    pub(crate) index_path: PathBuf,
    pub(crate) config_used: MemoryConfig,
    pub(crate) index_type_used: IndexType,
    pub(crate) processing_stats: ProcessingStats,
    pub(crate) build_stats: BuildStats,
    #[serde(default)]
    pub(crate) file_ranges: Vec<FileRange>,
}

/// Serializes `record` to `path`, replacing whatever was there.
pub(crate) fn write_build_record(
    path: &Path,
    record: &BuildRecord,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_build_record(path: &Path) -> Result<BuildRecord, Box<dyn std::error::Error>> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}
