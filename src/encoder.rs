use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{BuildError, HookCommand, HookError, MemoryConfig};

/// Substrings that identify an index-training failure in encoder output.
const TRAINING_FAILURE_MARKERS: &[&str] = &[
    "is_trained",
    "indexivfflat",
    "training",
    "nx >= k",
    "clustering",
];

/// Summary returned by the encoder. Known counters are typed; everything
/// else the encoder reports is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct BuildStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) total_chunks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) total_frames: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) video_size_mb: Option<f64>,
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, serde_json::Value>,
}

/// The video-memory encoder this crate drives. Implementations own the
/// chunk buffer and the index component.
pub(crate) trait MemoryEncoder {
    fn add_chunks(&mut self, chunks: Vec<String>);

    fn chunk_count(&self) -> usize;

    fn build(
        &mut self,
        config: &MemoryConfig,
        video_path: &Path,
        index_path: &Path,
    ) -> Result<BuildStats, BuildError>;

    /// Discards the index component so the next build recreates it from
    /// `config`.
    fn reset_index(&mut self, config: &MemoryConfig);
}

/// Maps a raw failure message onto the build error taxonomy.
pub(crate) fn classify_build_failure(message: &str) -> BuildError {
    let lower = message.to_lowercase();
    if TRAINING_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        BuildError::TrainingPrecondition(message.to_string())
    } else {
        BuildError::Other(message.to_string())
    }
}

#[derive(Debug, Serialize)]
struct BuildHookRequest<'a> {
    action: &'static str,
    chunks: &'a [String],
    config: &'a MemoryConfig,
    video_file: &'a Path,
    index_file: &'a Path,
    reset_index: bool,
}

#[derive(Debug, Deserialize)]
struct BuildHookResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    stats: Option<BuildStats>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_kind: Option<String>,
}

/// Encoder backed by an external hook command.
///
/// Request: `{"action": "build", "chunks": [...], "config": {...},
/// "video_file": ..., "index_file": ..., "reset_index": bool}`.
/// Response: `{"ok": true, "stats": {...}}` or
/// `{"ok": false, "error": "...", "error_kind": "training_precondition"}`.
pub(crate) struct HookEncoder {
    hook: HookCommand,
    chunks: Vec<String>,
    reset_pending: bool,
}

impl HookEncoder {
    pub(crate) fn new(hook: HookCommand) -> Self {
        Self {
            hook,
            chunks: Vec::new(),
            reset_pending: false,
        }
    }
}

impl MemoryEncoder for HookEncoder {
    fn add_chunks(&mut self, chunks: Vec<String>) {
        self.chunks.extend(chunks);
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn build(
        &mut self,
        config: &MemoryConfig,
        video_path: &Path,
        index_path: &Path,
    ) -> Result<BuildStats, BuildError> {
        let request = BuildHookRequest {
            action: "build",
            chunks: &self.chunks,
            config,
            video_file: video_path,
            index_file: index_path,
            reset_index: self.reset_pending,
        };
        let response: BuildHookResponse = match self.hook.call("build", &request) {
            Ok(response) => response,
            // a crashed encoder still tells us why on stderr
            Err(HookError::Failed(stderr)) => return Err(classify_build_failure(&stderr)),
            Err(err) => return Err(BuildError::Other(err.to_string())),
        };
        self.reset_pending = false;

        if response.ok {
            return Ok(response.stats.unwrap_or_default());
        }
        let message = response
            .error
            .unwrap_or_else(|| "encoder reported failure without a message".to_string());
        match response.error_kind.as_deref() {
            Some("training_precondition") => Err(BuildError::TrainingPrecondition(message)),
            Some(_) => Err(BuildError::Other(message)),
            None => Err(classify_build_failure(&message)),
        }
    }

    fn reset_index(&mut self, config: &MemoryConfig) {
        info!(index_type = %config.index.index_type, "index component will be recreated");
        self.reset_pending = true;
    }
}

/// Canonical artifact paths for a named memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArtifactPaths {
    pub(crate) video: PathBuf,
    pub(crate) index: PathBuf,
    pub(crate) metadata: PathBuf,
}

impl ArtifactPaths {
    pub(crate) fn for_memory(output_dir: &Path, memory_name: &str, config: &MemoryConfig) -> Self {
        Self {
            video: output_dir.join(format!(
                "{memory_name}.{}",
                config.codec.video_extension()
            )),
            index: output_dir.join(format!("{memory_name}_index.json")),
            metadata: output_dir.join(format!("{memory_name}_metadata.json")),
        }
    }
}
