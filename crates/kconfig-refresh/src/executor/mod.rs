use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::modules::Pipeline;
use crate::planner::Plan;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    StageStarted {
        id: String,
    },
    StageLog {
        id: String,
        line: String,
    },
    StageFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    stages_started: usize,
    stages_ok: usize,
    stages_failed: usize,
    log_lines: usize,
    failed_stages: Vec<String>,
    stage_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::StageStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.stages_started = s.stages_started.saturating_add(1);
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::StageLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                    append_stage_log_line(&mut s.stage_logs, &id, &line);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::StageFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let err_text = error.unwrap_or_default();
                let mut error_log = None;
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.stages_ok = s.stages_ok.saturating_add(1);
                        s.stage_logs.remove(&id);
                    } else {
                        s.stages_failed = s.stages_failed.saturating_add(1);
                        s.failed_stages.push(id.clone());
                        match write_stage_error_log(&mut s, &id, &err_text, elapsed_ms) {
                            Ok(path) => error_log = Some(path),
                            Err(e) => println!("WARN: failed to write error log for {id}: {e}"),
                        }
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                }
                if let Some(path) = error_log {
                    println!("ERROR_LOG: {id} => {}", path.display());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let summary = self.state.lock().ok().map(|mut s| {
                    let text = render_summary(&s, ok);
                    *s = StdoutSinkState::default();
                    text
                });
                if let Some(summary) = summary {
                    print!("{summary}");
                }
                if let Some(e) = error.filter(|_| !ok) {
                    println!("  error: {e}");
                }
            }
        }
    }
}

fn render_summary(s: &StdoutSinkState, ok: bool) -> String {
    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
    let mut summary = String::from("SUMMARY:\n");
    summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
    summary.push_str(&format!(
        "  stages: started={} ok={} failed={}\n",
        s.stages_started, s.stages_ok, s.stages_failed
    ));
    summary.push_str(&format!("  logs: {}\n", s.log_lines));
    summary.push_str(&format!("  elapsed: {}\n", format_elapsed_hms(wall.as_secs())));
    if !s.failed_stages.is_empty() {
        summary.push_str(&format!("  failed_stages: {}\n", s.failed_stages.join(", ")));
    }
    if !s.error_log_paths.is_empty() {
        summary.push_str("  error_logs:\n");
        for p in &s.error_log_paths {
            summary.push_str(&format!("    {}\n", p.display()));
        }
    }
    summary
}

/// Forwards every event over a channel; the receiver decides what to keep.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_stage_id: Option<String>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_stage_id: None,
        }
    }

    pub fn set_stage(&mut self, id: impl Into<String>) {
        self.current_stage_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_stage_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::StageLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Run a subprocess to completion, echoing its stdout and stderr line by line.
    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        self.run_captured(cmd).map(|_| ())
    }

    /// Like `run_cmd`, but also returns the non-empty stdout lines joined with `\n`.
    pub fn run_cmd_output(&self, cmd: Command) -> Result<String> {
        self.run_captured(cmd)
    }

    fn run_captured(&self, mut cmd: Command) -> Result<String> {
        let cmd_desc = format!("{:?}", cmd);
        tracing::debug!(command = ?cmd, "spawning");
        let mut child = cmd
            // A child reading the controlling TTY would block the whole run.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn failed for {cmd_desc}: {e}")))?;

        let (tx, rx) = mpsc::channel::<(OutputStream, String)>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, OutputStream::Stdout, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, OutputStream::Stderr, tx));
        }
        drop(tx);

        let mut stdout_lines = Vec::new();
        for (stream, line) in rx {
            if stream == OutputStream::Stdout {
                stdout_lines.push(line.clone());
            }
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed for {cmd_desc}: {e}")))?;
        if !status.success() {
            return Err(Error::msg(format!("command failed ({status}): {cmd_desc}")));
        }
        Ok(stdout_lines.join("\n"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

pub fn execute_plan(
    plan: &Plan,
    pipeline: &mut Pipeline,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for stage in plan.stages() {
        let id = stage.id();
        ctx.sink.emit(ExecEvent::StageStarted { id: id.into() });
        ctx.set_stage(id);
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {} ({})", id, stage.label()));
            ctx.sink.emit(ExecEvent::StageFinished {
                id: id.into(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        let start = Instant::now();
        let res = pipeline.run_stage(*stage, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::StageFinished {
                id: id.into(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::StageFinished {
                    id: id.into(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("[{}] stage '{id}' failed", plan.variant()));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

fn read_output_stream<R: Read>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let _ = tx.send((stream, line));
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    flush(&mut pending);
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }

    if !pending.is_empty() {
        flush(&mut pending);
    }
}

fn append_stage_log_line(
    stage_logs: &mut BTreeMap<String, VecDeque<String>>,
    stage_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;
    let q = stage_logs.entry(stage_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_stage_error_log(
    state: &mut StdoutSinkState,
    stage_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = ensure_error_logs_dir(state)?;
    let path = dir.join(format!("{}.log", sanitize_filename_component(stage_id)));

    let mut body = String::new();
    body.push_str(&format!("stage: {stage_id}\n"));
    body.push_str("status: failed\n");
    body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    if let Some(lines) = state.stage_logs.get(stage_id) {
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write stage error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn ensure_error_logs_dir(state: &mut StdoutSinkState) -> Result<PathBuf> {
    if let Some(existing) = state.error_logs_dir.as_ref() {
        return Ok(existing.clone());
    }

    let dir = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("build")
        .join("error-logs")
        .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    fs::create_dir_all(&dir).map_err(|e| {
        Error::msg(format!(
            "failed to create error logs dir {}: {e}",
            dir.display()
        ))
    })?;
    state.error_logs_dir = Some(dir.clone());
    Ok(dir)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "stage".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
