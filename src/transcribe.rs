use std::collections::HashSet;
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{TranscribeError, build_external_command, truncate_chars};

pub(crate) const DEFAULT_WHISPER_CLI: &str = "whisper-cli";
pub(crate) const DEFAULT_MODEL_PATH: &str = "models/ggml-medium.bin";
const MAX_TITLE_CHARS: usize = 100;
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// One entry of the episode export.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Episode {
    pub(crate) guid: String,
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) audio_url: Option<String>,
    pub(crate) published_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ProcessedEpisode {
    pub(crate) guid: String,
    pub(crate) title: String,
    pub(crate) transcript_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ProcessedLog {
    #[serde(default)]
    pub(crate) transcribed: Vec<ProcessedEpisode>,
}

impl ProcessedLog {
    /// Loads the log, creating an empty one on disk if it does not exist.
    pub(crate) fn load_or_init(path: &Path) -> Result<Self, TranscribeError> {
        if !path.exists() {
            let log = Self::default();
            log.save(path)?;
            println!("Created new processed file: {}", path.display());
            return Ok(log);
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), TranscribeError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub(crate) fn guids(&self) -> HashSet<String> {
        self.transcribed.iter().map(|e| e.guid.clone()).collect()
    }
}

/// An episode still to transcribe, with its 1-based chronological position.
#[derive(Debug, Clone)]
pub(crate) struct PendingEpisode {
    pub(crate) number: usize,
    pub(crate) episode: Episode,
    pub(crate) audio_url: String,
}

fn parse_published(episode: &Episode) -> Result<DateTime<FixedOffset>, TranscribeError> {
    DateTime::parse_from_rfc2822(episode.published_date.trim()).map_err(|_| {
        TranscribeError::BadDate {
            guid: episode.guid.clone(),
            value: episode.published_date.clone(),
        }
    })
}

/// Sorts oldest first, numbers every episode, then drops the ones already
/// processed or without audio. Numbers stay stable across runs.
pub(crate) fn plan_episodes(
    episodes: Vec<Episode>,
    processed: &HashSet<String>,
) -> Result<Vec<PendingEpisode>, TranscribeError> {
    let mut dated = episodes
        .into_iter()
        .map(|e| parse_published(&e).map(|date| (date, e)))
        .collect::<Result<Vec<_>, _>>()?;
    dated.sort_by_key(|(date, _)| *date);

    Ok(dated
        .into_iter()
        .enumerate()
        .filter_map(|(i, (_, episode))| {
            if processed.contains(&episode.guid) {
                return None;
            }
            let audio_url = episode.audio_url.clone().filter(|u| !u.is_empty())?;
            Some(PendingEpisode {
                number: i + 1,
                episode,
                audio_url,
            })
        })
        .collect())
}

pub(crate) fn clean_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

pub(crate) fn transcript_name(number: usize, title: &str) -> String {
    format!("{number}_{}.txt", truncate_chars(&clean_title(title), MAX_TITLE_CHARS))
}

/// Guids are often URLs sharing a long prefix, so the name comes from a hash.
pub(crate) fn temp_audio_name(guid: &str) -> String {
    let digest = blake3::hash(guid.as_bytes()).to_hex();
    format!("temp_{}.mp3", &digest[..16])
}

pub(crate) trait AudioSource {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), TranscribeError>;
}

pub(crate) struct HttpAudioSource {
    agent: ureq::Agent,
}

impl HttpAudioSource {
    pub(crate) fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_read(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build();
        Self { agent }
    }
}

impl AudioSource for HttpAudioSource {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), TranscribeError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| TranscribeError::Download(format!("{url}: {e}")))?;
        let mut file = File::create(dest)?;
        io::copy(&mut response.into_reader(), &mut file)?;
        Ok(())
    }
}

pub(crate) trait SpeechToText {
    /// Writes `<output_base>.txt`.
    fn transcribe(&self, audio: &Path, output_base: &Path) -> Result<(), TranscribeError>;
}

pub(crate) struct WhisperCli {
    pub(crate) program: PathBuf,
    pub(crate) model: PathBuf,
}

impl WhisperCli {
    pub(crate) fn args(&self, audio: &Path, output_base: &Path) -> Vec<String> {
        vec![
            "-m".to_string(),
            self.model.display().to_string(),
            "-f".to_string(),
            audio.display().to_string(),
            "-l".to_string(),
            "auto".to_string(),
            "-otxt".to_string(),
            "-of".to_string(),
            output_base.display().to_string(),
        ]
    }

    /// The program as given if it is a path, otherwise its location on PATH.
    pub(crate) fn locate(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return self.program.is_file().then(|| self.program.clone());
        }
        let path_var = env::var_os("PATH")?;
        env::split_paths(&path_var)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

impl SpeechToText for WhisperCli {
    fn transcribe(&self, audio: &Path, output_base: &Path) -> Result<(), TranscribeError> {
        let program = self.program.display().to_string();
        let output = build_external_command(&program, &self.args(audio, output_base)).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscribeError::Whisper {
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: truncate_chars(stderr.trim(), 200),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TranscribeSettings {
    pub(crate) export_file: PathBuf,
    pub(crate) output_dir: PathBuf,
    pub(crate) processed_file: Option<PathBuf>,
}

impl TranscribeSettings {
    /// Defaults to `<output dir name>_processed.json` in the working directory.
    pub(crate) fn processed_path(&self) -> PathBuf {
        self.processed_file.clone().unwrap_or_else(|| {
            let name = self
                .output_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "transcripts".to_string());
            PathBuf::from(format!("{name}_processed.json"))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TranscribeSummary {
    pub(crate) pending: usize,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
}

fn transcribe_episode(
    pending: &PendingEpisode,
    output_dir: &Path,
    source: &dyn AudioSource,
    stt: &dyn SpeechToText,
) -> Result<String, TranscribeError> {
    let title = &pending.episode.title;
    let name = transcript_name(pending.number, title);
    let transcript = output_dir.join(&name);
    let output_base = transcript.with_extension("");
    let audio = output_dir.join(temp_audio_name(&pending.episode.guid));

    let result = (|| -> Result<String, TranscribeError> {
        println!("Downloading: {}...", truncate_chars(title, 60));
        source.fetch(&pending.audio_url, &audio)?;
        println!("Transcribing: {}...", truncate_chars(title, 60));
        stt.transcribe(&audio, &output_base)?;
        if !transcript.is_file() {
            return Err(TranscribeError::MissingTranscript(transcript.clone()));
        }
        Ok(name)
    })();

    if audio.exists() {
        if let Err(err) = fs::remove_file(&audio) {
            warn!(path = %audio.display(), "could not remove temporary audio: {err}");
        }
    }
    result
}

/// Transcribes every pending episode, recording each success as it lands.
pub(crate) fn run_transcription(
    settings: &TranscribeSettings,
    source: &dyn AudioSource,
    stt: &dyn SpeechToText,
) -> Result<TranscribeSummary, TranscribeError> {
    if !settings.export_file.is_file() {
        return Err(TranscribeError::ExportMissing(settings.export_file.clone()));
    }
    fs::create_dir_all(&settings.output_dir)?;

    let processed_path = settings.processed_path();
    let mut log = ProcessedLog::load_or_init(&processed_path)?;
    let episodes: Vec<Episode> =
        serde_json::from_str(&fs::read_to_string(&settings.export_file)?)?;
    let pending = plan_episodes(episodes, &log.guids())?;

    println!("\nFound {} episodes to transcribe", pending.len());
    println!("Output directory: {}", settings.output_dir.display());
    println!("Tracking file: {}", processed_path.display());

    let mut summary = TranscribeSummary {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        println!("All episodes have been transcribed!");
        return Ok(summary);
    }

    for (i, item) in pending.iter().enumerate() {
        println!(
            "\nProcessing {}/{} (Episode #{}):",
            i + 1,
            pending.len(),
            item.number
        );
        match transcribe_episode(item, &settings.output_dir, source, stt) {
            Ok(transcript_file) => {
                println!("Completed: {}", truncate_chars(&item.episode.title, 60));
                log.transcribed.push(ProcessedEpisode {
                    guid: item.episode.guid.clone(),
                    title: item.episode.title.clone(),
                    transcript_file,
                });
                log.save(&processed_path)?;
                summary.succeeded += 1;
            }
            Err(err) => {
                warn!(guid = %item.episode.guid, "transcription failed: {err}");
                println!("Failed: {}: {err}", truncate_chars(&item.episode.title, 60));
                summary.failed += 1;
            }
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "transcription run finished"
    );
    Ok(summary)
}
