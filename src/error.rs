use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum CollectError {
    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

#[derive(Debug, Error)]
pub(crate) enum ExtractError {
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("epub extraction failed: {0}")]
    Epub(String),
    #[error("{0} support not compiled in")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error("No chunks to index: all {skipped} input file(s) were skipped")]
    NoChunks { skipped: usize },
}

/// Failure of a build attempt, classified at the encoder boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum BuildError {
    /// The requested index needs a training phase that could not run
    /// (typically too few vectors for the configured cluster count).
    #[error("index training failed: {0}")]
    TrainingPrecondition(String),
    #[error("build failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub(crate) enum LoadError {
    #[error("No video file found at {}", .0.display())]
    VideoNotFound(PathBuf),
    #[error("No index file found for video {}", .0.display())]
    IndexNotFound(PathBuf),
    #[error("Index file {} is not valid JSON: {reason}", path.display())]
    IndexCorrupt { path: PathBuf, reason: String },
    #[error("Metadata file {} is not valid JSON: {reason}", path.display())]
    MetadataCorrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub(crate) enum HookError {
    #[error("hook command is empty")]
    EmptyCommand,
    #[error("hook command is malformed: {0}")]
    Malformed(String),
    #[error("hook spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("hook io: {0}")]
    Io(#[source] std::io::Error),
    #[error("hook '{kind}' timed out after {timeout_ms}ms")]
    Timeout { kind: String, timeout_ms: u64 },
    #[error("hook error: {0}")]
    Failed(String),
    #[error("hook returned empty output")]
    EmptyOutput,
    #[error("hook json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub(crate) enum LlmError {
    #[error("{provider} request failed with status {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} transport error: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} stream read failed: {source}")]
    Stream {
        provider: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} response did not contain any text")]
    EmptyResponse(&'static str),
}

#[derive(Debug, Error)]
pub(crate) enum TranscribeError {
    #[error("whisper-cli not found at {}", .0.display())]
    WhisperMissing(PathBuf),
    #[error("Export file not found: {}", .0.display())]
    ExportMissing(PathBuf),
    #[error("invalid published_date '{value}' for episode {guid}")]
    BadDate { guid: String, value: String },
    #[error("download failed: {0}")]
    Download(String),
    #[error("whisper exited with {code}: {stderr}")]
    Whisper { code: String, stderr: String },
    #[error("transcript was not written: {}", .0.display())]
    MissingTranscript(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub(crate) enum RetrieveError {
    #[error("retriever hook: {0}")]
    Hook(#[from] HookError),
    #[error("retriever: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub(crate) enum FeedError {
    #[error("No feed URL: pass --feed-url or set RSS_FEED_URL")]
    MissingFeedUrl,
    #[error("{0} is not set")]
    MissingKey(&'static str),
    #[error("feed request failed: {0}")]
    Http(String),
    #[error("feed is not valid XML: {0}")]
    Xml(String),
    #[error("No channel found in RSS feed")]
    NoChannel,
    #[error("No cleaned descriptions found. Run 'feed clean' first.")]
    NothingCleaned,
    #[error("model reply is not valid JSON: {0}")]
    BadReply(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
