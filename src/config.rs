use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 1024;
pub(crate) const DEFAULT_OVERLAP: usize = 32;
pub(crate) const DEFAULT_NLIST: usize = 100;
pub(crate) const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub(crate) enum IndexType {
    /// Exact search, no training phase.
    #[serde(rename = "Flat")]
    #[value(name = "Flat")]
    Flat,
    /// Inverted-file index; needs enough vectors to train its clusters.
    #[serde(rename = "IVF")]
    #[value(name = "IVF")]
    Ivf,
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::Flat => f.write_str("Flat"),
            IndexType::Ivf => f.write_str("IVF"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Codec {
    H264,
    H265,
    Mp4v,
}

impl Codec {
    /// Container extension the encoder writes for this codec.
    pub(crate) fn video_extension(self) -> &'static str {
        match self {
            Codec::H264 | Codec::H265 => "mkv",
            Codec::Mp4v => "mp4",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::H264 => f.write_str("h264"),
            Codec::H265 => f.write_str("h265"),
            Codec::Mp4v => f.write_str("mp4v"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub(crate) chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub(crate) overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexConfig {
    #[serde(rename = "type", default = "default_index_type")]
    pub(crate) index_type: IndexType,
    #[serde(default = "default_nlist")]
    pub(crate) nlist: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_type: IndexType::Ivf,
            nlist: DEFAULT_NLIST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub(crate) model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

/// Everything the encoder needs to know about a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MemoryConfig {
    #[serde(default)]
    pub(crate) chunking: ChunkingConfig,
    #[serde(default)]
    pub(crate) index: IndexConfig,
    #[serde(default = "default_codec")]
    pub(crate) codec: Codec,
    #[serde(default)]
    pub(crate) embedding: EmbeddingConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            codec: Codec::H265,
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_overlap() -> usize {
    DEFAULT_OVERLAP
}

fn default_index_type() -> IndexType {
    IndexType::Ivf
}

fn default_nlist() -> usize {
    DEFAULT_NLIST
}

fn default_codec() -> Codec {
    Codec::H265
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

/// Per-run overrides. Unknown keys in a JSON overrides object are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct ConfigOverrides {
    #[serde(default)]
    pub(crate) chunk_size: Option<usize>,
    #[serde(default)]
    pub(crate) overlap: Option<usize>,
    #[serde(default)]
    pub(crate) index_type: Option<IndexType>,
    #[serde(default)]
    pub(crate) codec: Option<Codec>,
}

impl ConfigOverrides {
    pub(crate) fn is_empty(&self) -> bool {
        self.chunk_size.is_none()
            && self.overlap.is_none()
            && self.index_type.is_none()
            && self.codec.is_none()
    }
}

/// Layers `overrides` onto `base`. Values are taken as given; range checks
/// are left to the encoder.
pub(crate) fn merge_overrides(base: &MemoryConfig, overrides: &ConfigOverrides) -> MemoryConfig {
    let mut config = base.clone();
    if let Some(chunk_size) = overrides.chunk_size {
        config.chunking.chunk_size = chunk_size;
    }
    if let Some(overlap) = overrides.overlap {
        config.chunking.overlap = overlap;
    }
    if let Some(index_type) = overrides.index_type {
        config.index.index_type = index_type;
    }
    if let Some(codec) = overrides.codec {
        config.codec = codec;
    }
    config
}

/// Reads a full or partial configuration; missing fields take defaults.
pub(crate) fn load_file_config(path: &Path) -> Result<MemoryConfig, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("config {}: {e}", path.display()))?;
    let config = serde_json::from_str(&data)
        .map_err(|e| format!("config {}: {e}", path.display()))?;
    Ok(config)
}
