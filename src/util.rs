use std::env;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Child, Command as ProcessCommand};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

/// Time a process group gets to exit after SIGTERM before it is SIGKILLed.
const KILL_GRACE_MS: u64 = 500;

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Lowercased extension without the dot, or "" when there is none.
pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Timestamp used in generated file names (memory names, exports).
pub(crate) fn file_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) fn file_size_mb(path: &Path) -> f64 {
    std::fs::metadata(path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub(crate) fn is_stopword(token: &str) -> bool {
    matches!(
        token,
        "a" | "an"
            | "and"
            | "are"
            | "as"
            | "at"
            | "be"
            | "but"
            | "by"
            | "did"
            | "do"
            | "does"
            | "for"
            | "from"
            | "has"
            | "have"
            | "how"
            | "if"
            | "in"
            | "into"
            | "is"
            | "it"
            | "its"
            | "of"
            | "on"
            | "or"
            | "that"
            | "the"
            | "their"
            | "then"
            | "there"
            | "these"
            | "they"
            | "this"
            | "to"
            | "was"
            | "were"
            | "what"
            | "when"
            | "who"
            | "why"
            | "with"
            | "you"
            | "your"
    )
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub(crate) fn build_external_command(program: &str, args: &[String]) -> ProcessCommand {
    let mut cmd = ProcessCommand::new(program);
    cmd.args(args);

    // Own process group, so kill_process_tree reaches everything it spawns.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Stops a child started with `build_external_command` and every process in
/// its group, then reaps it.
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    // SIGTERM the group first.
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + Duration::from_millis(KILL_GRACE_MS);
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    // The leader may be gone while descendants still hold its pipes open.
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extensions_are_normalised() {
        assert_eq!(extension_of(&PathBuf::from("a/b.TXT")), "txt");
        assert_eq!(extension_of(&PathBuf::from("README")), "");
        assert_eq!(normalize_extension(" .MD "), "md");
        assert_eq!(normalize_extension("epub"), "epub");
    }

    #[test]
    fn tokenize_splits_and_lowercases() {
        assert_eq!(
            tokenize("Richard II's deposition, 1399!"),
            vec!["richard", "ii's", "deposition", "1399"]
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    #[cfg(unix)]
    #[test]
    fn kill_process_tree_reaches_grandchildren() {
        use std::io::Read;
        use std::process::Stdio;

        let args = vec!["-c".to_string(), "sleep 5; echo late".to_string()];
        let mut child = build_external_command("sh", &args)
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let start = Instant::now();
        kill_process_tree(&mut child);

        // EOF only arrives once the sleep holding the pipe is dead too.
        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert!(out.is_empty());
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
