use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{ChatBackend, ChatTurn, RawHit, Retriever, file_timestamp, truncate_chars};

/// Turns of history sent along with each question.
const MAX_HISTORY_TURNS: usize = 10;
const CONTEXT_PREVIEW_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChatCommand {
    Quit,
    Clear,
    Stats,
    Empty,
    Ask(String),
}

impl ChatCommand {
    pub(crate) fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => ChatCommand::Empty,
            "quit" | "exit" => ChatCommand::Quit,
            "clear" => ChatCommand::Clear,
            "stats" => ChatCommand::Stats,
            _ => ChatCommand::Ask(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionStats {
    pub(crate) started: DateTime<Utc>,
    pub(crate) questions: usize,
    pub(crate) failed_turns: usize,
    pub(crate) chunks_retrieved: usize,
    pub(crate) backend: String,
    pub(crate) video_file: PathBuf,
    pub(crate) index_file: PathBuf,
    pub(crate) memory_chunks: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConversationExport {
    pub(crate) exported_at: DateTime<Utc>,
    pub(crate) stats: SessionStats,
    pub(crate) conversation: Vec<ChatTurn>,
}

pub(crate) struct ChatSession {
    retriever: Box<dyn Retriever>,
    backend: Option<Box<dyn ChatBackend>>,
    history: Vec<ChatTurn>,
    stats: SessionStats,
    top_k: usize,
    output_dir: PathBuf,
}

impl ChatSession {
    pub(crate) fn new(
        retriever: Box<dyn Retriever>,
        backend: Option<Box<dyn ChatBackend>>,
        memory: (&Path, &Path, usize),
        top_k: usize,
        output_dir: PathBuf,
    ) -> Self {
        let (video_file, index_file, memory_chunks) = memory;
        let stats = SessionStats {
            started: Utc::now(),
            questions: 0,
            failed_turns: 0,
            chunks_retrieved: 0,
            backend: backend
                .as_ref()
                .map(|b| b.describe())
                .unwrap_or_else(|| "context-only".to_string()),
            video_file: video_file.to_path_buf(),
            index_file: index_file.to_path_buf(),
            memory_chunks,
        };
        Self {
            retriever,
            backend,
            history: Vec::new(),
            stats,
            top_k: top_k.max(1),
            output_dir,
        }
    }

    pub(crate) fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub(crate) fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Answers one question. Streamed text, if any, goes to `out`.
    pub(crate) fn respond(
        &mut self,
        question: &str,
        out: &mut dyn Write,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let hits = self.retriever.search(question, self.top_k)?;
        self.stats.chunks_retrieved += hits.len();

        let answer = match &self.backend {
            Some(backend) => {
                let system = system_prompt(&hits);
                let start = self.history.len().saturating_sub(MAX_HISTORY_TURNS);
                let mut turns = self.history[start..].to_vec();
                turns.push(ChatTurn::user(question));
                let text = backend.complete(&system, &turns, Some(&mut *out))?;
                writeln!(out)?;
                text
            }
            None => {
                let text = context_only_answer(&hits);
                writeln!(out, "{text}")?;
                text
            }
        };

        self.history.push(ChatTurn::user(question));
        self.history.push(ChatTurn::assistant(answer.clone()));
        self.stats.questions += 1;
        Ok(answer)
    }

    /// Reads commands until quit or EOF, then exports the conversation.
    pub(crate) fn run<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        out: &mut W,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        writeln!(
            out,
            "Chatting with {} chunks via {}. Commands: quit, exit, clear, stats.",
            self.stats.memory_chunks, self.stats.backend
        )?;
        loop {
            write!(out, "\nYou: ")?;
            out.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                break;
            }
            match ChatCommand::parse(&line) {
                ChatCommand::Quit => break,
                ChatCommand::Empty => continue,
                ChatCommand::Clear => {
                    self.history.clear();
                    writeln!(out, "Conversation history cleared.")?;
                }
                ChatCommand::Stats => {
                    writeln!(out, "{}", serde_json::to_string_pretty(&self.stats)?)?;
                }
                ChatCommand::Ask(question) => {
                    write!(out, "Assistant: ")?;
                    if let Err(err) = self.respond(&question, out) {
                        self.stats.failed_turns += 1;
                        warn!("chat turn failed: {err}");
                        writeln!(out, "\nError: {err}")?;
                    }
                }
            }
        }

        let path = self.export_conversation()?;
        writeln!(out, "Conversation saved to {}", path.display())?;
        Ok(path)
    }

    pub(crate) fn export_conversation(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self
            .output_dir
            .join(format!("conversation_{}.json", file_timestamp()));
        let export = ConversationExport {
            exported_at: Utc::now(),
            stats: self.stats.clone(),
            conversation: self.history.clone(),
        };
        fs::write(&path, serde_json::to_string_pretty(&export)?)?;
        info!(path = %path.display(), turns = self.history.len(), "conversation exported");
        Ok(path)
    }
}

fn format_context(hits: &[RawHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("[{}] {}", i + 1, truncate_chars(hit.text.trim(), CONTEXT_PREVIEW_CHARS)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn system_prompt(hits: &[RawHit]) -> String {
    let context = if hits.is_empty() {
        "(no relevant passages were found)".to_string()
    } else {
        format_context(hits)
    };
    format!(
        "You answer questions about a collection of podcast transcripts and documents.\n\
         Use the passages below as your primary source. If they do not contain the answer, say so.\n\n\
         Passages:\n{context}"
    )
}

pub(crate) fn context_only_answer(hits: &[RawHit]) -> String {
    if hits.is_empty() {
        return "No relevant context found in memory.".to_string();
    }
    format!("Relevant context from memory:\n\n{}", format_context(hits))
}
