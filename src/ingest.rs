use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{ChunkingConfig, IngestError, MemoryEncoder, extract_chunks};

/// Inclusive chunk-id span contributed by one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileRange {
    pub(crate) file: String,
    pub(crate) start_chunk: usize,
    pub(crate) end_chunk: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IngestReport {
    pub(crate) files_processed: usize,
    pub(crate) files_skipped: usize,
    pub(crate) total_chunks: usize,
    pub(crate) file_ranges: Vec<FileRange>,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Feeds every file's chunks to `encoder`, one file at a time. Files that
/// fail or yield no text are skipped; a run where nothing survives is an
/// error so an empty memory is never built.
pub(crate) fn ingest_files(
    files: &[PathBuf],
    chunking: &ChunkingConfig,
    encoder: &mut dyn MemoryEncoder,
) -> Result<IngestReport, IngestError> {
    let mut report = IngestReport::default();
    let total = files.len();

    for (i, path) in files.iter().enumerate() {
        let name = display_name(path);
        info!("[{}/{total}] processing {name}", i + 1);

        let chunks = match extract_chunks(path, chunking.chunk_size, chunking.overlap) {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!("skipping {}: {err}", path.display());
                report.files_skipped += 1;
                continue;
            }
        };
        if chunks.is_empty() {
            warn!("skipping {}: no text", path.display());
            report.files_skipped += 1;
            continue;
        }

        let start_chunk = encoder.chunk_count();
        let count = chunks.len();
        encoder.add_chunks(chunks);
        report.file_ranges.push(FileRange {
            file: name,
            start_chunk,
            end_chunk: start_chunk + count - 1,
        });
        report.files_processed += 1;
        report.total_chunks += count;
    }

    if report.files_processed == 0 {
        return Err(IngestError::NoChunks {
            skipped: report.files_skipped,
        });
    }
    Ok(report)
}
