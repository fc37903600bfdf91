use std::io::{Read, Write};
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{HookError, build_external_command, kill_process_tree};

pub(crate) const DEFAULT_HOOK_TIMEOUT_MS: u64 = 30 * 60 * 1000;
const HOOK_STREAM_CAP_BYTES: usize = 16 * 1024 * 1024;
const HOOK_POLL_SLEEP_MS: u64 = 10;

/// An external program that reads one JSON request on stdin and writes one
/// JSON response on stdout.
#[derive(Debug, Clone)]
pub(crate) struct HookCommand {
    pub(crate) argv: Vec<String>,
    pub(crate) timeout_ms: u64,
}

impl HookCommand {
    pub(crate) fn parse(command: &str, timeout_ms: u64) -> Result<Self, HookError> {
        let argv = shlex::split(command).ok_or_else(|| HookError::Malformed(command.to_string()))?;
        if argv.is_empty() {
            return Err(HookError::EmptyCommand);
        }
        Ok(Self { argv, timeout_ms })
    }

    pub(crate) fn call<I: Serialize, O: DeserializeOwned>(
        &self,
        kind: &str,
        input: &I,
    ) -> Result<O, HookError> {
        let payload = serde_json::to_vec(input)?;
        let raw = run_hook_command(&self.argv, &payload, self.timeout_ms, kind)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn spawn_capture<R: Read + Send + 'static>(reader: R) -> thread::JoinHandle<(Vec<u8>, bool)> {
    thread::spawn(move || {
        let mut captured: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut buffer = [0_u8; 8192];
        let mut reader = reader;
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let remaining = HOOK_STREAM_CAP_BYTES.saturating_sub(captured.len());
                    let take = remaining.min(n);
                    captured.extend_from_slice(&buffer[..take]);
                    if n > take {
                        truncated = true;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        (captured, truncated)
    })
}

pub(crate) fn run_hook_command(
    command: &[String],
    payload: &[u8],
    timeout_ms: u64,
    kind: &str,
) -> Result<String, HookError> {
    let Some((program, args)) = command.split_first() else {
        return Err(HookError::EmptyCommand);
    };
    let mut cmd = build_external_command(program, args);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PODMEM_HOOK", kind);

    debug!(kind, program = %program, "running hook");
    let mut child = cmd.spawn().map_err(HookError::Spawn)?;

    // Readers start before the write so a chatty child cannot fill its pipe
    // and block while we are still feeding stdin.
    let mut stdout_handle = child.stdout.take().map(spawn_capture);
    let mut stderr_handle = child.stderr.take().map(spawn_capture);

    if let Some(mut stdin) = child.stdin.take() {
        let written = stdin.write_all(payload).and_then(|_| stdin.flush());
        drop(stdin);
        if let Err(err) = written {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                kill_process_tree(&mut child);
                return Err(HookError::Io(err));
            }
        }
    }

    let timeout = Duration::from_millis(timeout_ms.max(1));
    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if start.elapsed() >= timeout {
            timed_out = true;
            kill_process_tree(&mut child);
            break child.wait().map_err(HookError::Io);
        }
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => thread::sleep(Duration::from_millis(HOOK_POLL_SLEEP_MS)),
            Err(e) => {
                kill_process_tree(&mut child);
                break Err(HookError::Io(e));
            }
        }
    };

    let collect =
        |handle: &mut Option<thread::JoinHandle<(Vec<u8>, bool)>>| -> (Vec<u8>, bool) {
            handle
                .take()
                .and_then(|join| join.join().ok())
                .unwrap_or_else(|| (Vec::new(), false))
        };
    let (stdout, stdout_truncated) = collect(&mut stdout_handle);
    let (stderr, stderr_truncated) = collect(&mut stderr_handle);

    if timed_out {
        return Err(HookError::Timeout {
            kind: kind.to_string(),
            timeout_ms,
        });
    }

    let status = status?;
    if !status.success() {
        let mut stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        if stderr.is_empty() {
            stderr = format!("exited with {status}");
        } else if stderr_truncated {
            stderr.push_str(" (stderr output truncated)");
        }
        return Err(HookError::Failed(stderr));
    }

    let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
    if stdout.is_empty() {
        return Err(HookError::EmptyOutput);
    }
    if stdout_truncated {
        return Err(HookError::Failed("hook output exceeded capture limit".into()));
    }
    Ok(stdout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_like_a_shell() {
        let hook = HookCommand::parse("python3 -m memvid_hook --flag 'a b'", 10).unwrap();
        assert_eq!(hook.argv, vec!["python3", "-m", "memvid_hook", "--flag", "a b"]);
        assert!(matches!(HookCommand::parse("   ", 10), Err(HookError::EmptyCommand)));
    }

    #[test]
    fn echoes_stdin_back_as_json() {
        let hook = HookCommand::parse("cat", 5_000).unwrap();
        let out: serde_json::Value = hook
            .call("test", &serde_json::json!({"hello": "world"}))
            .unwrap();
        assert_eq!(out["hello"], "world");
    }

    #[test]
    fn nonzero_exit_reports_stderr() {
        let hook = HookCommand::parse("sh -c 'echo boom >&2; exit 3'", 5_000).unwrap();
        let err = hook
            .call::<_, serde_json::Value>("test", &serde_json::json!({}))
            .unwrap_err();
        match err {
            HookError::Failed(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slow_hook_times_out() {
        let hook = HookCommand::parse("sleep 5", 100).unwrap();
        let err = hook
            .call::<_, serde_json::Value>("slow", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, HookError::Timeout { .. }));
    }

    #[test]
    fn timeout_is_enforced_through_a_shell_wrapper() {
        let hook = HookCommand::parse("sh -c 'sleep 4; echo {}'", 200).unwrap();
        let start = Instant::now();
        let err = hook
            .call::<_, serde_json::Value>("slow", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, HookError::Timeout { timeout_ms: 200, .. }));
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    }
}
