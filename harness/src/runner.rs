//! Worker subprocesses for `inctune swarm`.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::watch,
};

use crate::store::now_timestamp;

/// Result of a worker process.
#[derive(Debug)]
pub struct RunResult {
    pub worker_id: usize,
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Tail of stderr when the worker failed.
    pub error: Option<String>,
    /// Last build status the worker printed.
    pub status: Option<String>,
}

/// Progress parsed from a worker's `TuneProgress` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub step: usize,
    pub candidate: String,
    pub outcome: String,
}

fn extract_field(s: &str, key: &str) -> Option<usize> {
    let idx = s.find(key)?;
    let rest = &s[idx + key.len()..];
    rest.trim_start_matches(|c: char| !c.is_ascii_digit())
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

fn extract_quoted(s: &str, key: &str) -> Option<String> {
    let idx = s.find(key)?;
    let rest = s[idx + key.len()..].trim_start().strip_prefix('"')?;
    Some(rest[..rest.find('"')?].to_string())
}

fn extract_word(s: &str, key: &str) -> Option<String> {
    let idx = s.find(key)?;
    let word: String = s[idx + key.len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!word.is_empty()).then_some(word)
}

impl ProgressUpdate {
    /// Parse from `TuneProgress` display output.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        if !line.starts_with("TuneProgress {") {
            return None;
        }

        Some(Self {
            step: extract_field(line, "step:")?,
            candidate: extract_quoted(line, "candidate:")?,
            outcome: extract_word(line, "outcome:")?,
        })
    }
}

/// Parse the `status: <status>` summary line a worker prints on exit.
fn parse_status(line: &str) -> Option<String> {
    line.strip_prefix("status: ")
        .map(|s| s.trim().to_string())
}

/// Spawns and supervises `inctune run` workers.
pub struct Runner {
    /// Path to the inctune binary.
    inctune_binary: String,
    config_path: PathBuf,
    log_dir: PathBuf,
    /// `RUST_LOG` value for child processes.
    rust_log: Option<String>,
}

impl Runner {
    #[must_use]
    pub fn new(
        inctune_binary: impl Into<String>,
        config_path: impl AsRef<Path>,
        log_dir: impl AsRef<Path>,
        rust_log: Option<String>,
    ) -> Self {
        Self {
            inctune_binary: inctune_binary.into(),
            config_path: config_path.as_ref().to_path_buf(),
            log_dir: log_dir.as_ref().to_path_buf(),
            rust_log,
        }
    }

    /// Find the inctune binary: this executable, then common build locations.
    #[must_use]
    pub fn find_inctune_binary() -> Option<String> {
        if let Ok(exe) = std::env::current_exe()
            && exe.file_stem().is_some_and(|s| s == "inctune")
        {
            return Some(exe.display().to_string());
        }

        let candidates = [
            "./target/release/inctune",
            "./target/debug/inctune",
            "inctune",
        ];
        for candidate in candidates {
            if Path::new(candidate).exists() {
                return Some(candidate.to_string());
            }
        }

        if let Ok(output) = std::process::Command::new("which").arg("inctune").output()
            && output.status.success()
        {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }

        None
    }

    #[must_use]
    pub fn worker_args(&self, worker_id: usize) -> Vec<String> {
        vec![
            "run".to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--worker-id".to_string(),
            worker_id.to_string(),
        ]
    }

    /// Spawn one worker.
    pub fn spawn(&self, worker_id: usize) -> Result<RunHandle, RunError> {
        let args = self.worker_args(worker_id);
        tracing::debug!("Spawning: {} {}", self.inctune_binary, args.join(" "));

        let mut cmd = Command::new(&self.inctune_binary);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref rust_log) = self.rust_log {
            cmd.env("RUST_LOG", rust_log);
        }
        let child = cmd.spawn().map_err(|e| RunError::Spawn(worker_id, e))?;
        let pid = child
            .id()
            .ok_or_else(|| RunError::Spawn(worker_id, std::io::Error::other("no PID")))?;

        Ok(RunHandle {
            worker_id,
            child,
            pid,
        })
    }

    /// Wait for a worker, teeing its output into the log directory and
    /// forwarding progress updates.
    pub async fn wait(
        &self,
        mut handle: RunHandle,
        progress_tx: Option<Arc<watch::Sender<ProgressUpdate>>>,
    ) -> RunResult {
        let _ = tokio::fs::create_dir_all(&self.log_dir).await;
        let stdout_path = self
            .log_dir
            .join(format!("worker-{}.stdout.log", handle.worker_id));
        let stderr_path = self
            .log_dir
            .join(format!("worker-{}.stderr.log", handle.worker_id));

        let timestamp = now_timestamp();

        // Stream stdout to file, parse progress, remember the final status line
        let stdout = handle.child.stdout.take();
        let stdout_task = stdout.map(|stdout| {
            let ts = timestamp.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut file = open_log(&stdout_path, &ts).await;
                let mut status = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref mut f) = file {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                    if let Some(ref tx) = progress_tx
                        && let Some(update) = ProgressUpdate::parse(&line)
                    {
                        let _ = tx.send(update);
                    }
                    if let Some(s) = parse_status(&line) {
                        status = Some(s);
                    }
                }
                status
            })
        });

        // Stream stderr to file and keep last 20 lines for error reporting
        let stderr = handle.child.stderr.take();
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut file = open_log(&stderr_path, &timestamp).await;
                let mut tail = VecDeque::with_capacity(20);
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref mut f) = file {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                    if tail.len() >= 20 {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>()
            })
        });

        let exit = handle.child.wait().await;

        let status = match stdout_task {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };
        let stderr_output = match stderr_task {
            Some(task) => task.await.ok(),
            None => None,
        };

        match exit {
            Ok(exit) if exit.success() => RunResult {
                worker_id: handle.worker_id,
                success: true,
                exit_code: exit.code(),
                error: None,
                status,
            },
            Ok(exit) => RunResult {
                worker_id: handle.worker_id,
                success: false,
                exit_code: exit.code(),
                error: Some(stderr_output.map_or_else(
                    || format!("Exit code: {:?}", exit.code()),
                    |lines| lines.join("\n"),
                )),
                status,
            },
            Err(e) => RunResult {
                worker_id: handle.worker_id,
                success: false,
                exit_code: None,
                error: Some(format!("Process error: {e}")),
                status,
            },
        }
    }
}

/// Open a log for appending, separating earlier runs.
async fn open_log(path: &Path, timestamp: &str) -> Option<tokio::fs::File> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()?;
    if file.metadata().await.is_ok_and(|m| m.len() > 0) {
        let _ = file
            .write_all(format!("\n--- restart at {timestamp} ---\n\n").as_bytes())
            .await;
    }
    Some(file)
}

/// Handle to a running worker.
pub struct RunHandle {
    pub worker_id: usize,
    child: Child,
    pub pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn worker {0}: {1}")]
    Spawn(usize, std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{StepEvent, StepOutcome};

    #[test]
    fn test_parse_progress_line() {
        let event = StepEvent {
            step: 12,
            candidate: "knn-dtw".to_string(),
            outcome: StepOutcome::Trained {
                fully_trained: false,
            },
        };
        let update = ProgressUpdate::parse(&event.to_string()).unwrap();
        assert_eq!(
            update,
            ProgressUpdate {
                step: 12,
                candidate: "knn-dtw".to_string(),
                outcome: "partial".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_ignores_other_lines() {
        assert!(ProgressUpdate::parse("INFO evaluating knn").is_none());
        assert!(ProgressUpdate::parse("TuneProgress { step: x }").is_none());
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status("status: done"), Some("done".to_string()));
        assert_eq!(parse_status("members: 3"), None);
    }

    #[test]
    fn test_worker_args() {
        let runner = Runner::new("inctune", "tune.toml", "logs", None);
        assert_eq!(
            runner.worker_args(3),
            ["run", "--config", "tune.toml", "--worker-id", "3"]
        );
    }
}
