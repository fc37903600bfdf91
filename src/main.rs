// Module declarations
mod build;
mod chat;
mod cli;
mod collect;
mod config;
mod encoder;
mod error;
mod extract;
mod feed;
mod hook;
mod ingest;
mod llm;
mod metadata;
mod resolve;
mod retriever;
mod server;
mod transcribe;
mod util;

// Everything is re-exported at the crate root so modules can refer to each
// other as `crate::Name`.
#[allow(unused_imports)]
pub(crate) use build::*;
#[allow(unused_imports)]
pub(crate) use chat::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use collect::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use encoder::*;
#[allow(unused_imports)]
pub(crate) use error::*;
#[allow(unused_imports)]
pub(crate) use extract::*;
#[allow(unused_imports)]
pub(crate) use feed::*;
#[allow(unused_imports)]
pub(crate) use hook::*;
#[allow(unused_imports)]
pub(crate) use ingest::*;
#[allow(unused_imports)]
pub(crate) use llm::*;
#[allow(unused_imports)]
pub(crate) use metadata::*;
#[allow(unused_imports)]
pub(crate) use resolve::*;
#[allow(unused_imports)]
pub(crate) use retriever::*;
#[allow(unused_imports)]
pub(crate) use server::*;
#[allow(unused_imports)]
pub(crate) use transcribe::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info, warn};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("podmem=info,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let credentials = ProviderCredentials::from_env();

    let result = match cli.command {
        Command::Chat(args) => run_chat(args, &credentials),
        Command::Serve {
            index_base,
            host,
            port,
            retriever_hook,
            hook_timeout_ms,
        } => run_serve(&index_base, &host, port, retriever_hook.as_deref(), hook_timeout_ms),
        Command::Transcribe {
            export_file,
            output_dir,
            processed_file,
            whisper_cli,
            model_path,
        } => run_transcribe(
            TranscribeSettings {
                export_file,
                output_dir,
                processed_file,
            },
            WhisperCli {
                program: whisper_cli,
                model: model_path,
            },
        ),
        Command::Feed(args) => run_feed(args, &credentials),
    };

    if let Err(err) = result {
        error!("{err}");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn resolve_config(args: &ChatArgs) -> Result<MemoryConfig, Box<dyn std::error::Error>> {
    let base = match &args.config {
        Some(path) => load_file_config(path)?,
        None => MemoryConfig::default(),
    };
    let overrides = ConfigOverrides {
        chunk_size: args.chunk_size,
        overlap: args.overlap,
        index_type: args.index_type,
        codec: args.codec,
    };
    if !overrides.is_empty() {
        info!(?overrides, "applying command-line overrides");
    }
    Ok(merge_overrides(&base, &overrides))
}

fn make_retriever(
    hook: Option<&str>,
    timeout_ms: u64,
    video: &Path,
    index: &Path,
    index_json: &serde_json::Value,
) -> Result<Box<dyn Retriever>, Box<dyn std::error::Error>> {
    let retriever: Box<dyn Retriever> = match hook {
        Some(command) => Box::new(HookRetriever::new(
            HookCommand::parse(command, timeout_ms)?,
            video.to_path_buf(),
            index.to_path_buf(),
        )),
        None => {
            let retriever = IndexTextRetriever::from_index(index_json);
            info!(chunks = retriever.len(), "using keyword retrieval over index text");
            Box::new(retriever)
        }
    };
    Ok(retriever)
}

/// Where a chat run stands once its input has been looked at.
enum ChatMemory {
    /// The input held no supported files; nothing was built.
    NothingToDo,
    /// A memory was built and `--build-only` was given.
    BuiltOnly,
    Ready(ResolvedMemory),
}

/// Loads the memory named by `--load-existing`, or collects the inputs and
/// builds one. An input with no supported files stops before any encoder
/// is needed.
fn prepare_memory(
    args: &ChatArgs,
    config: MemoryConfig,
    out: &mut dyn Write,
) -> Result<ChatMemory, Box<dyn std::error::Error>> {
    if let Some(existing) = &args.load_existing {
        let resolved = resolve_existing(existing)?;
        writeln!(
            out,
            "Loaded memory {} ({} chunks, {:.2} MB)",
            resolved.video.display(),
            resolved.chunk_count,
            resolved.video_size_mb
        )?;
        if let Some(path) = &resolved.metadata {
            match read_build_record(path) {
                Ok(record) => writeln!(
                    out,
                    "Built {} from {} source file(s) with a {} index",
                    record.created.format("%Y-%m-%d %H:%M:%S UTC"),
                    record.source_files.len(),
                    record.index_type_used
                )?,
                Err(err) => warn!(path = %path.display(), "unreadable build record: {err}"),
            }
        }
        return Ok(ChatMemory::Ready(resolved));
    }

    let source = match &args.input_dir {
        Some(dir) => InputSource::Directory(dir.clone()),
        None => InputSource::Files(args.files.clone()),
    };
    let extensions = if args.extensions.is_empty() {
        default_extensions()
    } else {
        args.extensions.clone()
    };
    let files = collect_files(&source, &extensions)?;
    if files.is_empty() {
        writeln!(out, "No supported files found")?;
        return Ok(ChatMemory::NothingToDo);
    }
    writeln!(out, "Found {} file(s) to process", files.len())?;

    let Some(hook) = args.encoder_hook.as_deref() else {
        return Err("building a memory needs an encoder: pass --encoder-hook".into());
    };
    let mut encoder = HookEncoder::new(HookCommand::parse(hook, args.hook_timeout_ms)?);
    let memory_name = args
        .memory_name
        .clone()
        .unwrap_or_else(|| format!("memory_{}", file_timestamp()));

    let built = build_memory(
        BuildRequest {
            files,
            config,
            output_dir: args.output_dir.clone(),
            memory_name,
        },
        &mut encoder,
    )?;
    let stats = &built.record.processing_stats;
    writeln!(
        out,
        "Built {} from {} file(s) ({} skipped) in {:.2}s with a {} index",
        built.paths.video.display(),
        stats.files_processed,
        stats.files_skipped,
        stats.total_time,
        built.record.index_type_used
    )?;
    writeln!(out, "Index: {}", built.paths.index.display())?;
    writeln!(out, "Metadata: {}", built.paths.metadata.display())?;
    if args.build_only {
        return Ok(ChatMemory::BuiltOnly);
    }
    Ok(ChatMemory::Ready(resolve_existing(&built.paths.video)?))
}

fn run_chat(
    args: ChatArgs,
    credentials: &ProviderCredentials,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;
    let memory = match prepare_memory(&args, config, &mut io::stdout())? {
        ChatMemory::NothingToDo | ChatMemory::BuiltOnly => return Ok(()),
        ChatMemory::Ready(memory) => memory,
    };

    let retriever = make_retriever(
        args.retriever_hook.as_deref(),
        args.hook_timeout_ms,
        &memory.video,
        &memory.index,
        &memory.index_json,
    )?;
    let backend: Option<Box<dyn ChatBackend>> = match credentials.key_for(args.provider) {
        Some(key) => Some(Box::new(LlmClient::new(
            args.provider,
            args.model.clone(),
            key.to_string(),
        ))),
        None => {
            warn!(
                "{} is not set; answers will contain retrieved context only",
                args.provider.env_key()
            );
            None
        }
    };

    let mut session = ChatSession::new(
        retriever,
        backend,
        (&memory.video, &memory.index, memory.chunk_count),
        args.top_k,
        args.output_dir.clone(),
    );
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    session.run(stdin.lock(), &mut stdout)?;
    info!(
        questions = session.stats().questions,
        failed = session.stats().failed_turns,
        turns = session.history().len(),
        "chat session ended"
    );
    Ok(())
}

fn run_serve(
    index_base: &str,
    host: &str,
    port: u16,
    retriever_hook: Option<&str>,
    hook_timeout_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let api = if index_base == TEST_INDEX_BASE {
        warn!("starting search API in test mode; no index loaded");
        SearchApi::test_mode()
    } else {
        let paths = IndexPaths::from_base(&PathBuf::from(index_base))?;
        let hook = retriever_hook
            .map(|command| HookCommand::parse(command, hook_timeout_ms))
            .transpose()?;
        let loaded = LoadedIndex::load(&paths, |paths, index_json| -> Box<dyn Retriever> {
            match hook {
                Some(hook) => Box::new(HookRetriever::new(
                    hook,
                    paths.video.clone(),
                    paths.index.clone(),
                )),
                None => Box::new(IndexTextRetriever::from_index(index_json)),
            }
        })?;
        info!(base = index_base, "index loaded");
        SearchApi::new(loaded)
    };
    run_search_server(&api, host, port)
}

fn run_transcribe(
    settings: TranscribeSettings,
    whisper: WhisperCli,
) -> Result<(), Box<dyn std::error::Error>> {
    if whisper.locate().is_none() {
        return Err(TranscribeError::WhisperMissing(whisper.program.clone()).into());
    }
    let summary = run_transcription(&settings, &HttpAudioSource::new(), &whisper)?;
    if summary.pending > 0 {
        println!("\n{}", "=".repeat(50));
        println!("Transcription complete!");
        println!("Success: {}", summary.succeeded);
        println!("Failed: {}", summary.failed);
        println!(
            "Total processed: {}/{}",
            summary.succeeded + summary.failed,
            summary.pending
        );
    }
    Ok(())
}

fn feed_backend(
    args: &FeedArgs,
    credentials: &ProviderCredentials,
    openai_default: &str,
) -> Result<LlmClient, FeedError> {
    let key = credentials
        .key_for(args.provider)
        .ok_or(FeedError::MissingKey(args.provider.env_key()))?;
    Ok(LlmClient::new(
        args.provider,
        feed_model(args.provider, args.model.clone(), openai_default),
        key.to_string(),
    ))
}

fn run_feed(
    args: FeedArgs,
    credentials: &ProviderCredentials,
) -> Result<(), Box<dyn std::error::Error>> {
    let state_file = args.state_file.clone();
    let mut state = FeedState::load(&state_file)?;
    match &args.action {
        FeedAction::Ingest { feed_url } => {
            let url = feed_url
                .clone()
                .or_else(|| env_optional(FEED_URL_ENV))
                .ok_or(FeedError::MissingFeedUrl)?;
            info!(url = %url, "fetching feed");
            let added = state.merge(parse_rss(&fetch_feed(&url)?)?);
            state.save(&state_file)?;
            println!("Ingested {added} new episodes. Total: {}", state.episodes.len());
        }
        FeedAction::Clean => {
            let backend = feed_backend(&args, credentials, FEED_MODEL)?;
            clean_descriptions(&mut state, &backend, |s| s.save(&state_file))?;
        }
        FeedAction::GenerateTaxonomy => {
            let backend = feed_backend(&args, credentials, TAXONOMY_MODEL)?;
            let taxonomy = generate_taxonomy(&state, &backend)?;
            taxonomy.save(&args.taxonomy_file)?;
            println!("{}", serde_json::to_string_pretty(&taxonomy)?);
            println!("Taxonomy saved to {}", args.taxonomy_file.display());
        }
        FeedAction::Tag => {
            let taxonomy = Taxonomy::load(&args.taxonomy_file)?;
            let backend = feed_backend(&args, credentials, FEED_MODEL)?;
            tag_episodes(&mut state, &backend, &taxonomy, |s| s.save(&state_file))?;
        }
        FeedAction::Validate => {
            let taxonomy = Taxonomy::load(&args.taxonomy_file)?;
            let report = validate_state(&state, &taxonomy);
            println!("Valid: {}", report.valid);
            println!("Invalid: {}", report.invalid);
            for line in report.errors.iter().take(10) {
                println!("  {line}");
            }
            if report.errors.len() > 10 {
                println!("  ... and {} more", report.errors.len() - 10);
            }
        }
        FeedAction::Fix => {
            let taxonomy = Taxonomy::load(&args.taxonomy_file)?;
            let report = fix_state(&mut state, &taxonomy);
            if report.is_empty() {
                println!("No fixes needed");
            } else {
                for line in &report {
                    println!("{line}");
                }
                state.save(&state_file)?;
                println!("Fixed {} episodes", report.len());
            }
        }
        FeedAction::Export { output_dir } => {
            let (path, count) = write_export(&state, output_dir)?;
            println!("Exported {count} episodes to {}", path.display());
        }
    }
    Ok(())
}
