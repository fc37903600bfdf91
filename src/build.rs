use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    ArtifactPaths, BuildError, BuildRecord, BuildStats, IndexType, MemoryConfig, MemoryEncoder,
    ProcessingStats, ingest_files, write_build_record,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildAttempt {
    Requested,
    FlatFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BuildOutcome {
    pub(crate) stats: BuildStats,
    pub(crate) index_type_used: IndexType,
    pub(crate) fell_back: bool,
}

/// Builds with the configured index type. If the index cannot be trained,
/// switches `config` to a flat index, recreates the index component and
/// tries exactly once more. Any other failure leaves `config` untouched.
pub(crate) fn build_with_fallback(
    encoder: &mut dyn MemoryEncoder,
    config: &mut MemoryConfig,
    paths: &ArtifactPaths,
) -> Result<BuildOutcome, BuildError> {
    let mut attempt = BuildAttempt::Requested;
    loop {
        match encoder.build(config, &paths.video, &paths.index) {
            Ok(stats) => {
                return Ok(BuildOutcome {
                    stats,
                    index_type_used: config.index.index_type,
                    fell_back: attempt == BuildAttempt::FlatFallback,
                });
            }
            Err(BuildError::TrainingPrecondition(reason)) if attempt == BuildAttempt::Requested => {
                warn!(
                    requested = %config.index.index_type,
                    "index training failed ({reason}); retrying with a Flat index"
                );
                config.index.index_type = IndexType::Flat;
                encoder.reset_index(config);
                attempt = BuildAttempt::FlatFallback;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BuildRequest {
    pub(crate) files: Vec<PathBuf>,
    pub(crate) config: MemoryConfig,
    pub(crate) output_dir: PathBuf,
    pub(crate) memory_name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct BuiltMemory {
    pub(crate) paths: ArtifactPaths,
    pub(crate) record: BuildRecord,
}

/// Ingest → encode (with fallback) → build record.
pub(crate) fn build_memory(
    request: BuildRequest,
    encoder: &mut dyn MemoryEncoder,
) -> Result<BuiltMemory, Box<dyn std::error::Error>> {
    let BuildRequest {
        files,
        mut config,
        output_dir,
        memory_name,
    } = request;
    let started = Instant::now();

    let report = ingest_files(&files, &config.chunking, encoder)?;
    let processing_time = started.elapsed().as_secs_f64();
    info!(
        files = report.files_processed,
        skipped = report.files_skipped,
        chunks = report.total_chunks,
        "ingestion finished in {processing_time:.2}s"
    );

    fs::create_dir_all(&output_dir)?;
    let paths = ArtifactPaths::for_memory(&output_dir, &memory_name, &config);

    info!(
        codec = %config.codec,
        index = %config.index.index_type,
        "encoding {} chunks into {}",
        encoder.chunk_count(),
        paths.video.display()
    );
    let encode_started = Instant::now();
    let outcome = build_with_fallback(encoder, &mut config, &paths)?;
    let encoding_time = encode_started.elapsed().as_secs_f64();
    if outcome.fell_back {
        warn!(
            "memory '{memory_name}' was persisted with a {} index, not the requested one",
            outcome.index_type_used
        );
    }

    let record = BuildRecord {
        created: Utc::now(),
        source_files: files.iter().map(|p| p.display().to_string()).collect(),
        video_path: paths.video.clone(),
        index_path: paths.index.clone(),
        config_used: config,
        index_type_used: outcome.index_type_used,
        processing_stats: ProcessingStats {
            files_processed: report.files_processed,
            files_skipped: report.files_skipped,
            processing_time,
            encoding_time,
            total_time: started.elapsed().as_secs_f64(),
        },
        build_stats: outcome.stats,
        file_ranges: report.file_ranges,
    };
    write_build_record(&paths.metadata, &record)?;
    info!(metadata = %paths.metadata.display(), "build record written");

    Ok(BuiltMemory { paths, record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::RecordingEncoder;
    use crate::{IngestError, read_build_record};
    use std::path::Path;

    /// Encoder whose build results are scripted per call.
    struct ScriptedEncoder {
        results: Vec<Result<BuildStats, BuildError>>,
        calls: usize,
        resets: Vec<IndexType>,
    }

    impl ScriptedEncoder {
        fn new(results: Vec<Result<BuildStats, BuildError>>) -> Self {
            Self {
                results,
                calls: 0,
                resets: Vec::new(),
            }
        }
    }

    impl MemoryEncoder for ScriptedEncoder {
        fn add_chunks(&mut self, _chunks: Vec<String>) {}

        fn chunk_count(&self) -> usize {
            0
        }

        fn build(
            &mut self,
            _config: &MemoryConfig,
            _video_path: &Path,
            _index_path: &Path,
        ) -> Result<BuildStats, BuildError> {
            let result = self.results[self.calls].clone();
            self.calls += 1;
            result
        }

        fn reset_index(&mut self, config: &MemoryConfig) {
            self.resets.push(config.index.index_type);
        }
    }

    fn paths() -> ArtifactPaths {
        ArtifactPaths::for_memory(Path::new("out"), "m", &MemoryConfig::default())
    }

    fn stats(frames: usize) -> BuildStats {
        BuildStats {
            total_frames: Some(frames),
            ..Default::default()
        }
    }

    #[test]
    fn training_failure_falls_back_to_flat() {
        let mut encoder = ScriptedEncoder::new(vec![
            Err(crate::classify_build_failure(
                "Error in faiss::IndexIVF::add_with_ids: 'is_trained' failed",
            )),
            Ok(stats(42)),
        ]);
        let mut config = MemoryConfig::default();
        assert_eq!(config.index.index_type, IndexType::Ivf);

        let outcome = build_with_fallback(&mut encoder, &mut config, &paths()).unwrap();
        assert_eq!(outcome.stats, stats(42));
        assert!(outcome.fell_back);
        assert_eq!(outcome.index_type_used, IndexType::Flat);
        assert_eq!(config.index.index_type, IndexType::Flat);
        assert_eq!(encoder.calls, 2);
        assert_eq!(encoder.resets, vec![IndexType::Flat]);
    }

    #[test]
    fn other_failure_propagates_and_config_is_unchanged() {
        let mut encoder =
            ScriptedEncoder::new(vec![Err(crate::classify_build_failure("codec h265 unavailable"))]);
        let mut config = MemoryConfig::default();
        let before = config.clone();

        let err = build_with_fallback(&mut encoder, &mut config, &paths()).unwrap_err();
        assert_eq!(err, BuildError::Other("codec h265 unavailable".into()));
        assert_eq!(config, before);
        assert_eq!(encoder.calls, 1);
        assert!(encoder.resets.is_empty());
    }

    #[test]
    fn fallback_failure_is_final() {
        let mut encoder = ScriptedEncoder::new(vec![
            Err(BuildError::TrainingPrecondition("is_trained".into())),
            Err(BuildError::TrainingPrecondition("still failing".into())),
        ]);
        let mut config = MemoryConfig::default();
        let err = build_with_fallback(&mut encoder, &mut config, &paths()).unwrap_err();
        assert_eq!(err, BuildError::TrainingPrecondition("still failing".into()));
        assert_eq!(encoder.calls, 2);
    }

    #[test]
    fn first_attempt_success_does_not_touch_config() {
        let mut encoder = ScriptedEncoder::new(vec![Ok(stats(1))]);
        let mut config = MemoryConfig::default();
        let outcome = build_with_fallback(&mut encoder, &mut config, &paths()).unwrap();
        assert!(!outcome.fell_back);
        assert_eq!(outcome.index_type_used, IndexType::Ivf);
    }

    #[test]
    fn metadata_round_trip_after_build() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let b = input.path().join("b.txt");
        let a = input.path().join("a.txt");
        let blank = input.path().join("blank.txt");
        fs::write(&b, "Second episode about the Tudors.").unwrap();
        fs::write(&a, "First episode about the Romans.").unwrap();
        fs::write(&blank, "").unwrap();
        let files = vec![b, blank, a];

        let mut encoder = RecordingEncoder::default();
        let built = build_memory(
            BuildRequest {
                files: files.clone(),
                config: MemoryConfig::default(),
                output_dir: output.path().to_path_buf(),
                memory_name: "history".into(),
            },
            &mut encoder,
        )
        .unwrap();

        let record = read_build_record(&built.paths.metadata).unwrap();
        assert_eq!(record.processing_stats.files_processed, 2);
        assert_eq!(record.processing_stats.files_skipped, 1);
        let expected: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
        assert_eq!(record.source_files, expected);
        assert_eq!(record.build_stats.total_chunks, Some(2));
        assert_eq!(record.file_ranges.len(), 2);
        assert!(built.paths.video.exists());
        assert!(built.paths.index.exists());
    }

    #[test]
    fn nothing_ingested_means_no_build() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let blank = input.path().join("blank.txt");
        fs::write(&blank, "\n").unwrap();
        let mut encoder = RecordingEncoder::default();
        let err = build_memory(
            BuildRequest {
                files: vec![blank],
                config: MemoryConfig::default(),
                output_dir: output.path().join("out"),
                memory_name: "empty".into(),
            },
            &mut encoder,
        )
        .unwrap_err();
        assert!(err.downcast_ref::<IngestError>().is_some());
        assert_eq!(encoder.builds, 0);
        assert!(!output.path().join("out").exists());
    }
}
