//! Source readers: append-only files, process output, and terminal
//! multiplexer panes. One reader task per source; every task observes a
//! per-source stop signal and removes its own registration on source loss.

use notify::{RecursiveMode, Watcher};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::domain::{Result, TokenOpsError};

use super::engine::{Detector, SourceHandle, SourceKind};

/// Lines replayed from the end of a file when a watch begins.
const INITIAL_TAIL_LINES: usize = 50;

impl Detector {
    /// Watch an append-only log file: tail the last lines immediately, then
    /// follow change notifications. Returns the source id.
    pub async fn watch_file(self: &Arc<Self>, path: PathBuf) -> Result<String> {
        let source_id = format!("file:{}", path.display());
        if self.has_source(&source_id) {
            return Ok(source_id);
        }

        let mut offset = 0u64;
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            offset = contents.len() as u64;
            let start = contents
                .lines()
                .count()
                .saturating_sub(INITIAL_TAIL_LINES);
            for line in contents.lines().skip(start) {
                self.process_line(SourceKind::File, &source_id, line);
            }
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = notify_tx.send(res);
        })
        .map_err(|e| TokenOpsError::Internal(format!("watcher init failed: {}", e)))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| TokenOpsError::Internal(format!("watch {} failed: {}", path.display(), e)))?;

        let detector = Arc::clone(self);
        let id = source_id.clone();
        let task = tokio::spawn(async move {
            // Keeps the watcher alive for the lifetime of the task.
            let _watcher = watcher;
            let mut pending = String::new();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    event = notify_rx.recv() => {
                        match event {
                            Some(Ok(ev)) if ev.kind.is_remove() => {
                                warn!(source = %id, "monitored file removed");
                                detector.drop_source(&id);
                                break;
                            }
                            Some(Ok(_)) => {
                                match detector.read_appended(&path, &mut offset, &mut pending, &id).await {
                                    Ok(()) => {}
                                    Err(e) => {
                                        warn!(source = %id, error = %e, "monitored file lost");
                                        detector.drop_source(&id);
                                        break;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(source = %id, error = %e, "file watcher error");
                                detector.drop_source(&id);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        self.register_source(source_id.clone(), SourceKind::File, stop_tx, task);
        Ok(source_id)
    }

    async fn read_appended(
        self: &Arc<Self>,
        path: &PathBuf,
        offset: &mut u64,
        pending: &mut String,
        source_id: &str,
    ) -> Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        let len = meta.len();

        // Truncation resets the tail to the start of the file.
        if len < *offset {
            *offset = 0;
            pending.clear();
        }
        if len == *offset {
            return Ok(());
        }

        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(*offset)).await?;
        let mut buf = Vec::with_capacity((len - *offset) as usize);
        file.read_to_end(&mut buf).await?;
        *offset = len;

        pending.push_str(&String::from_utf8_lossy(&buf));
        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                self.process_line(SourceKind::File, source_id, line);
            }
        }

        Ok(())
    }

    /// Stream a spawned process's stdout and stderr line by line.
    pub async fn watch_process(self: &Arc<Self>, command: &str) -> Result<String> {
        let source_id = format!("proc:{}", command);
        if self.has_source(&source_id) {
            return Ok(source_id);
        }

        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| TokenOpsError::config("empty process command"))?;

        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| TokenOpsError::Internal(format!("spawn '{}' failed: {}", command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TokenOpsError::internal("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TokenOpsError::internal("child stderr not captured"))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let detector = Arc::clone(self);
        let id = source_id.clone();
        let task = tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        let _ = child.kill().await;
                        break;
                    }
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => { detector.process_line(SourceKind::Process, &id, &line); }
                        _ => out_open = false,
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => { detector.process_line(SourceKind::Process, &id, &line); }
                        _ => err_open = false,
                    },
                }
            }

            warn!(source = %id, "monitored process ended");
            detector.drop_source(&id);
        });

        self.register_source(source_id.clone(), SourceKind::Process, stop_tx, task);
        Ok(source_id)
    }

    /// Poll a terminal multiplexer pane by capturing its contents on an
    /// interval and feeding only lines that appeared since the last capture.
    pub async fn watch_multiplexer(
        self: &Arc<Self>,
        target: &str,
        poll_interval: Duration,
    ) -> Result<String> {
        let source_id = format!("term:{}", target);
        if self.has_source(&source_id) {
            return Ok(source_id);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let detector = Arc::clone(self);
        let id = source_id.clone();
        let pane = target.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut previous: Vec<String> = Vec::new();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let output = tokio::process::Command::new("tmux")
                            .args(["capture-pane", "-p", "-t", &pane])
                            .output()
                            .await;

                        let capture = match output {
                            Ok(out) if out.status.success() => {
                                String::from_utf8_lossy(&out.stdout).to_string()
                            }
                            Ok(out) => {
                                warn!(
                                    source = %id,
                                    status = %out.status,
                                    "pane capture failed, removing source"
                                );
                                detector.drop_source(&id);
                                break;
                            }
                            Err(e) => {
                                warn!(source = %id, error = %e, "tmux unavailable, removing source");
                                detector.drop_source(&id);
                                break;
                            }
                        };

                        let lines: Vec<String> = capture
                            .lines()
                            .map(str::trim_end)
                            .filter(|l| !l.is_empty())
                            .map(String::from)
                            .collect();

                        for line in new_pane_lines(&previous, &lines) {
                            detector.process_line(SourceKind::Terminal, &id, line);
                        }
                        previous = lines;
                    }
                }
            }
        });

        self.register_source(source_id.clone(), SourceKind::Terminal, stop_tx, task);
        Ok(source_id)
    }

    pub fn active_sources(&self) -> Vec<String> {
        self.sources.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_source(&self, source_id: &str) -> bool {
        self.sources.lock().unwrap().contains_key(source_id)
    }

    /// Stop and deregister a source. Idempotent.
    pub fn remove_source(&self, source_id: &str) -> bool {
        let handle = self.sources.lock().unwrap().remove(source_id);
        match handle {
            Some(handle) => {
                let _ = handle.stop.send(true);
                self.clear_debounce(source_id);
                debug!(source = source_id, kind = %handle.kind, "source removed");
                true
            }
            None => false,
        }
    }

    /// Stop every source and wait a bounded drain period per task.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, SourceHandle)> =
            self.sources.lock().unwrap().drain().collect();
        for (id, handle) in handles {
            let _ = handle.stop.send(true);
            self.clear_debounce(&id);
            if tokio::time::timeout(Duration::from_secs(1), handle.task)
                .await
                .is_err()
            {
                debug!(source = %id, "source task did not drain in time");
            }
        }
    }

    fn register_source(
        &self,
        source_id: String,
        kind: SourceKind,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    ) {
        self.sources
            .lock()
            .unwrap()
            .insert(source_id, SourceHandle { kind, stop, task });
    }

    /// Called from a source's own task when the underlying source is gone.
    fn drop_source(&self, source_id: &str) {
        self.sources.lock().unwrap().remove(source_id);
        self.clear_debounce(source_id);
    }
}

/// A pane capture is a viewport, not an append-only stream: only lines after
/// the previous capture's last line are new. Falls back to the whole capture
/// when the previous tail is no longer visible.
fn new_pane_lines<'a>(previous: &[String], current: &'a [String]) -> &'a [String] {
    let Some(prev_tail) = previous.last() else {
        return current;
    };
    match current.iter().rposition(|l| l == prev_tail) {
        Some(pos) => &current[pos + 1..],
        None => current,
    }
}
