use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::{
    Codec, DEFAULT_HOOK_TIMEOUT_MS, DEFAULT_MODEL_PATH, DEFAULT_STATE_FILE, DEFAULT_TAXONOMY_FILE,
    DEFAULT_WHISPER_CLI, IndexType, Provider,
};

#[derive(Parser)]
#[command(name = "podmem")]
#[command(about = "Build, query and serve video-encoded memories of podcast transcripts", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Build a memory from documents (or load one) and chat with it.
    Chat(ChatArgs),

    /// Serve the HTTP search API over a built memory.
    Serve {
        /// Base path of the memory, without extension (`test` for an empty API)
        #[arg(long)]
        index_base: String,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// External retriever command (JSON on stdin/stdout)
        #[arg(long)]
        retriever_hook: Option<String>,
        #[arg(long, default_value_t = DEFAULT_HOOK_TIMEOUT_MS)]
        hook_timeout_ms: u64,
    },

    /// Download and transcribe podcast episodes from an export file.
    Transcribe {
        /// Episode export JSON (list of {guid, title, audio_url, published_date})
        #[arg(long)]
        export_file: PathBuf,
        #[arg(long, default_value = "transcripts")]
        output_dir: PathBuf,
        /// Progress file (default: <output dir name>_processed.json)
        #[arg(long)]
        processed_file: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_WHISPER_CLI)]
        whisper_cli: PathBuf,
        #[arg(long, default_value = DEFAULT_MODEL_PATH)]
        model_path: PathBuf,
    },

    /// Track a podcast RSS feed: ingest, clean, tag and export episodes.
    Feed(FeedArgs),
}

#[derive(Args, Debug, Clone)]
pub(crate) struct FeedArgs {
    #[command(subcommand)]
    pub(crate) action: FeedAction,
    /// Episode state file
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    pub(crate) state_file: PathBuf,
    /// Taxonomy file (the built-in taxonomy is used when it does not exist)
    #[arg(long, default_value = DEFAULT_TAXONOMY_FILE)]
    pub(crate) taxonomy_file: PathBuf,
    #[arg(long, value_enum, default_value_t = Provider::Openai)]
    pub(crate) provider: Provider,
    /// Model name (default: gpt-4.1-mini, o3-mini for taxonomy generation)
    #[arg(long)]
    pub(crate) model: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum FeedAction {
    /// Fetch the feed and add episodes not seen before
    Ingest {
        /// Feed URL (default: $RSS_FEED_URL)
        #[arg(long)]
        feed_url: Option<String>,
    },
    /// Clean episode descriptions with the LLM
    Clean,
    /// Build a taxonomy from the cleaned descriptions
    GenerateTaxonomy,
    /// Tag cleaned episodes against the taxonomy
    Tag,
    /// Check every episode's tags against the taxonomy
    Validate,
    /// Repair invalid tags, deleting those that cannot be repaired
    Fix,
    /// Write tagged episodes to export_<timestamp>.json
    Export {
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
#[command(group(
    ArgGroup::new("input")
        .required(true)
        .args(["input_dir", "files", "load_existing"])
))]
pub(crate) struct ChatArgs {
    /// Directory to scan recursively for documents
    #[arg(long)]
    pub(crate) input_dir: Option<PathBuf>,
    /// Explicit list of documents
    #[arg(long, num_args = 1..)]
    pub(crate) files: Vec<PathBuf>,
    /// Existing memory: directory, video file or base name
    #[arg(long)]
    pub(crate) load_existing: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Provider::Google)]
    pub(crate) provider: Provider,
    /// Model name (default depends on provider)
    #[arg(long)]
    pub(crate) model: Option<String>,
    /// Memory name (default: memory_<timestamp>)
    #[arg(long)]
    pub(crate) memory_name: Option<String>,

    #[arg(long)]
    pub(crate) chunk_size: Option<usize>,
    #[arg(long)]
    pub(crate) overlap: Option<usize>,
    #[arg(long, value_enum)]
    pub(crate) index_type: Option<IndexType>,
    #[arg(long, value_enum)]
    pub(crate) codec: Option<Codec>,
    /// Accepted file extensions (default: txt md pdf doc docx rtf epub html htm)
    #[arg(long, num_args = 1..)]
    pub(crate) extensions: Vec<String>,

    #[arg(long, default_value = "output")]
    pub(crate) output_dir: PathBuf,
    /// JSON configuration file layered under the command-line overrides
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// External encoder command (JSON on stdin/stdout)
    #[arg(long)]
    pub(crate) encoder_hook: Option<String>,
    /// External retriever command (JSON on stdin/stdout)
    #[arg(long)]
    pub(crate) retriever_hook: Option<String>,
    #[arg(long, default_value_t = DEFAULT_HOOK_TIMEOUT_MS)]
    pub(crate) hook_timeout_ms: u64,
    /// Passages retrieved per question
    #[arg(long, default_value_t = 5)]
    pub(crate) top_k: usize,
    /// Build the memory and exit without starting a chat
    #[arg(long)]
    pub(crate) build_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn input_sources_are_mutually_exclusive() {
        let err = Cli::try_parse_from(["podmem", "chat", "--input-dir", "a", "--load-existing", "b"]);
        assert!(err.is_err());
        assert!(Cli::try_parse_from(["podmem", "chat"]).is_err());
    }

    #[test]
    fn chat_overrides_parse() {
        let cli = Cli::try_parse_from([
            "podmem",
            "chat",
            "--files",
            "a.txt",
            "b.pdf",
            "--chunk-size",
            "2048",
            "--overlap",
            "307",
            "--index-type",
            "Flat",
            "--codec",
            "h264",
            "--provider",
            "openai",
        ])
        .unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.chunk_size, Some(2048));
        assert_eq!(args.overlap, Some(307));
        assert_eq!(args.index_type, Some(IndexType::Flat));
        assert_eq!(args.codec, Some(Codec::H264));
        assert_eq!(args.provider, Provider::Openai);
        assert_eq!(args.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["podmem", "serve", "--index-base", "out/pods"]).unwrap();
        let Command::Serve { host, port, .. } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8000);
    }

    #[test]
    fn feed_options_precede_the_action() {
        let cli = Cli::try_parse_from([
            "podmem",
            "feed",
            "--state-file",
            "data/state.json",
            "ingest",
            "--feed-url",
            "https://example.com/rss",
        ])
        .unwrap();
        let Command::Feed(args) = cli.command else {
            panic!("expected feed");
        };
        assert_eq!(args.state_file, PathBuf::from("data/state.json"));
        assert_eq!(args.taxonomy_file, PathBuf::from("taxonomy.json"));
        assert_eq!(args.provider, Provider::Openai);
        assert_eq!(
            args.action,
            FeedAction::Ingest {
                feed_url: Some("https://example.com/rss".into())
            }
        );

        let cli = Cli::try_parse_from(["podmem", "feed", "generate-taxonomy"]).unwrap();
        let Command::Feed(args) = cli.command else {
            panic!("expected feed");
        };
        assert_eq!(args.action, FeedAction::GenerateTaxonomy);
        assert_eq!(args.state_file, PathBuf::from("state.json"));
    }
}
