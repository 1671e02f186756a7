//! Runs external tools, alone or chained into pipelines.
//!
//! Every byte the engine moves goes through a [`Pipeline`]: `cat` into a
//! decompressor into `partclone` for a restore, `partclone` into a
//! compressor into `split` for a backup. Each stage is tagged with a
//! [`Stage`] so a failure names the step that broke, which is what lets an
//! operator tell a corrupt image (decompress) from failing media (restore).
//!
//! All stages of a pipeline share one process group. The group is
//! registered with the job's [`ProcessGroups`] while it runs, so a caller
//! can cancel the job by terminating it.
pub mod parsers;

use crate::context::{OperationContext, ProcessGroups};
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parsers::parser_for;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

const SBIN_DIRS: [&str; 3] = ["/usr/sbin", "/sbin", "/usr/local/sbin"];

/// Stderr lines kept per stage for error reports.
const TAIL_LINES: usize = 8;

/// The role a command plays in an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Concatenating image volumes.
    Stream,
    Decompress,
    /// Writing data onto the target partition or device.
    Restore,
    /// Reading data off the source partition or device.
    Capture,
    Compress,
    Split,
    /// Device-to-device copy.
    Copy,
    /// Wiping a device.
    Erase,
    Hash,
    /// Writing or re-reading a partition table.
    Layout,
    /// Read-only queries such as `lsblk` or `sfdisk --dump`.
    Probe,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Stream => "stream",
            Stage::Decompress => "decompress",
            Stage::Restore => "restore",
            Stage::Capture => "capture",
            Stage::Compress => "compress",
            Stage::Split => "split",
            Stage::Copy => "copy",
            Stage::Erase => "erase",
            Stage::Hash => "hash",
            Stage::Layout => "layout",
            Stage::Probe => "probe",
        };
        f.write_str(name)
    }
}

/// Locates `name` on `PATH`, then in the sbin directories that non-root
/// `PATH`s often omit.
pub fn find_tool(name: &str) -> Result<PathBuf> {
    if let Ok(path) = which::which(name) {
        return Ok(path);
    }
    SBIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| Error::ToolMissing(name.to_string()))
}

/// Locates the first available tool of `names`.
pub fn find_first(names: &[&str]) -> Result<PathBuf> {
    names
        .iter()
        .find_map(|name| find_tool(name).ok())
        .ok_or_else(|| Error::ToolMissing(names.join(" or ")))
}

/// The partclone binary name for a filesystem type, if partclone handles it.
pub fn partclone_program(fstype: &str) -> Option<&'static str> {
    match fstype.to_ascii_lowercase().as_str() {
        "ext2" => Some("partclone.ext2"),
        "ext3" => Some("partclone.ext3"),
        "ext4" => Some("partclone.ext4"),
        "vfat" | "fat" | "fat12" | "fat16" | "fat32" => Some("partclone.fat"),
        "ntfs" => Some("partclone.ntfs"),
        "exfat" => Some("partclone.exfat"),
        "xfs" => Some("partclone.xfs"),
        "btrfs" => Some("partclone.btrfs"),
        "hfsplus" => Some("partclone.hfsp"),
        "dd" => Some("partclone.dd"),
        _ => None,
    }
}

/// The installed partclone binary for `fstype`, or `None` when the
/// filesystem is unknown or the tool is not installed.
pub fn partclone_tool(fstype: &str) -> Option<PathBuf> {
    partclone_program(fstype).and_then(|name| find_tool(name).ok())
}

/// One argv, tagged with its stage.
#[derive(Clone, Debug)]
pub struct StageCommand {
    stage: Stage,
    program: PathBuf,
    args: Vec<OsString>,
}

impl StageCommand {
    pub fn new(stage: Stage, program: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Looks `tool` up with [`find_tool`] and starts a command for it.
    pub fn tool(stage: Stage, tool: &str) -> Result<Self> {
        Ok(Self::new(stage, find_tool(tool)?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn failure(&self, status: ExitStatus, detail: String) -> Error {
        Error::CommandFailed {
            stage: self.stage,
            command: self.to_string(),
            status: describe_status(status),
            detail: if detail.is_empty() {
                "command failed".to_string()
            } else {
                detail
            },
        }
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => match Signal::try_from(sig) {
            Ok(signal) => format!("killed by {signal}"),
            Err(_) => format!("killed by signal {sig}"),
        },
        _ => status.to_string(),
    }
}

fn killed_by_sigpipe(status: ExitStatus) -> bool {
    status.signal() == Some(Signal::SIGPIPE as i32)
}

/// Runs a short command to completion and returns its stdout.
///
/// `input` is written to the command's stdin when given.
///
/// # Errors
///
/// Returns [`Error::CommandFailed`] carrying the last line of stderr (or
/// stdout) when the command exits nonzero.
pub fn run_checked(cmd: &StageCommand, input: Option<&str>) -> Result<String> {
    debug!(stage = %cmd.stage, command = %cmd, "Running command");
    let mut child = cmd
        .command()
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = last_line(&stderr)
        .or_else(|| last_line(&stdout))
        .unwrap_or_default();
    warn!(stage = %cmd.stage, command = %cmd, status = %output.status, %detail, "Command failed");
    Err(cmd.failure(output.status, detail))
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .map(str::to_string)
}

/// Where the last stage of a pipeline writes.
#[derive(Debug, Default)]
pub enum Output {
    #[default]
    Null,
    File(File),
    /// Left as a pipe, taken with [`RunningPipeline::take_stdout`].
    Piped,
}

/// A chain of commands connected stdout to stdin.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<StageCommand>,
    stdin: Option<File>,
    stdout: Output,
    monitor: Option<usize>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, cmd: StageCommand) -> Self {
        self.stages.push(cmd);
        self
    }

    pub fn stdin(mut self, file: File) -> Self {
        self.stdin = Some(file);
        self
    }

    pub fn stdout(mut self, output: Output) -> Self {
        self.stdout = output;
        self
    }

    /// Picks the stage whose stderr drives progress. Defaults to the
    /// last stage of the given [`Stage`] kind, else the last stage.
    pub fn monitor(mut self, stage: Stage) -> Self {
        self.monitor = self.stages.iter().rposition(|s| s.stage == stage);
        self
    }

    pub fn stages(&self) -> &[StageCommand] {
        &self.stages
    }

    /// Starts every stage in a fresh process group registered with `groups`.
    ///
    /// # Errors
    ///
    /// Fails if the pipeline is empty, a stage cannot be spawned, or the
    /// job has already been cancelled. Stages already started are killed.
    pub fn spawn(self, groups: &ProcessGroups) -> Result<RunningPipeline> {
        if self.stages.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty pipeline",
            )));
        }
        if groups.is_terminated() {
            return Err(Error::Cancelled);
        }
        let monitor = self.monitor.unwrap_or(self.stages.len() - 1);
        let last = self.stages.len() - 1;
        let mut stdin = self.stdin;
        let mut stdout = Some(self.stdout);

        let mut running = RunningPipeline {
            children: Vec::with_capacity(self.stages.len()),
            pgid: None,
            groups: groups.clone(),
            lines: None,
            tails: Vec::new(),
            readers: Vec::new(),
            stdout: None,
            parser_program: self.stages[monitor].program.clone(),
        };
        let mut upstream: Option<ChildStdout> = None;

        for (index, stage) in self.stages.into_iter().enumerate() {
            let mut cmd = stage.command();
            cmd.process_group(running.pgid.map_or(0, Pid::as_raw));
            cmd.stderr(Stdio::piped());
            match upstream.take() {
                Some(pipe) => cmd.stdin(Stdio::from(pipe)),
                None => match stdin.take() {
                    Some(file) => cmd.stdin(Stdio::from(file)),
                    None => cmd.stdin(Stdio::null()),
                },
            };
            if index == last {
                match stdout.take().unwrap_or_default() {
                    Output::Null => cmd.stdout(Stdio::null()),
                    Output::File(file) => cmd.stdout(Stdio::from(file)),
                    Output::Piped => cmd.stdout(Stdio::piped()),
                };
            } else {
                cmd.stdout(Stdio::piped());
            }

            debug!(stage = %stage.stage, command = %stage, "Starting pipeline stage");
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    running.kill();
                    let _ = running.reap();
                    return Err(e.into());
                }
            };

            if running.pgid.is_none() {
                let pgid = Pid::from_raw(child.id() as i32);
                running.pgid = Some(pgid);
                if !groups.register(pgid) {
                    let _ = child.wait();
                    return Err(Error::Cancelled);
                }
            }

            if index == last {
                running.stdout = child.stdout.take();
            } else {
                upstream = child.stdout.take();
            }

            let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
            if let Some(stderr) = child.stderr.take() {
                let sender = if index == monitor {
                    let (tx, rx) = mpsc::channel();
                    running.lines = Some(rx);
                    Some(tx)
                } else {
                    None
                };
                let tail = tail.clone();
                running
                    .readers
                    .push(thread::spawn(move || read_stderr(stderr, tail, sender)));
            }
            running.tails.push(tail);
            running.children.push((stage, child));
        }

        Ok(running)
    }

    /// Spawns the pipeline, reports progress until it exits, and checks
    /// every stage.
    ///
    /// Returns the byte count last reported by the monitored stage.
    pub fn run(
        self,
        ctx: &OperationContext,
        title: &str,
        subtitle: Option<String>,
        total: Option<u64>,
    ) -> Result<Option<u64>> {
        let mut running = self.spawn(ctx.process_groups())?;
        let mut tracker = ProgressTracker::new(title, subtitle, total);
        running.watch(ctx, &mut tracker);
        running.wait()?;
        Ok(tracker.bytes())
    }
}

/// Splits a stderr stream on `\r` and `\n`, forwarding lines to `sender`
/// and keeping the last few in `tail`.
fn read_stderr<R: Read>(
    stderr: R,
    tail: Arc<Mutex<VecDeque<String>>>,
    sender: Option<Sender<String>>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    let emit = |raw: &[u8]| {
        let line = String::from_utf8_lossy(raw).trim().to_string();
        if line.is_empty() {
            return;
        }
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        if let Some(tx) = &sender {
            let _ = tx.send(line);
        }
    };
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\r' || byte == b'\n' {
                emit(&pending);
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }
    emit(&pending);
}

/// A spawned [`Pipeline`].
#[derive(Debug)]
pub struct RunningPipeline {
    children: Vec<(StageCommand, Child)>,
    pgid: Option<Pid>,
    groups: ProcessGroups,
    lines: Option<Receiver<String>>,
    tails: Vec<Arc<Mutex<VecDeque<String>>>>,
    readers: Vec<JoinHandle<()>>,
    stdout: Option<ChildStdout>,
    parser_program: PathBuf,
}

impl RunningPipeline {
    /// The last stage's stdout when spawned with [`Output::Piped`].
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Publishes progress parsed from the monitored stage's stderr until
    /// that stream closes.
    ///
    /// With no new line for one refresh interval, a spinner-only update is
    /// published instead.
    pub fn watch(&mut self, ctx: &OperationContext, tracker: &mut ProgressTracker) {
        let Some(lines) = self.lines.take() else {
            return;
        };
        let parser = parser_for(&self.parser_program);
        let refresh = ctx.settings().progress_refresh();
        ctx.emit(tracker.initial());
        loop {
            match lines.recv_timeout(refresh) {
                Ok(line) => {
                    trace!(%line, "stderr");
                    let sample = parser.parse(&line);
                    if !sample.is_empty() {
                        ctx.emit(tracker.observe(sample, Instant::now()));
                    }
                }
                Err(RecvTimeoutError::Timeout) => ctx.emit(tracker.tick()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Kills every stage.
    pub fn kill(&self) {
        if let Some(pgid) = self.pgid {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }

    fn reap(&mut self) -> Vec<Option<ExitStatus>> {
        self.stdout = None;
        let statuses = self
            .children
            .iter_mut()
            .map(|(_, child)| child.wait().ok())
            .collect();
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        if let Some(pgid) = self.pgid {
            self.groups.unregister(pgid);
        }
        statuses
    }

    /// Waits for every stage and checks their exit statuses.
    ///
    /// # Errors
    ///
    /// Stages are checked from upstream to downstream and the first failure
    /// is reported. A stage killed by `SIGPIPE` only lost its reader, so it
    /// is blamed only when no other stage failed.
    pub fn wait(mut self) -> Result<()> {
        let statuses = self.reap();
        let failures: Vec<(usize, ExitStatus)> = statuses
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.filter(|s| !s.success()).map(|s| (i, s)))
            .collect();
        let blamed = failures
            .iter()
            .find(|(_, s)| !killed_by_sigpipe(*s))
            .or_else(|| failures.first());

        if let Some(&(index, status)) = blamed {
            let (cmd, _) = &self.children[index];
            let detail = self.tails[index]
                .lock()
                .ok()
                .and_then(|t| t.back().cloned())
                .unwrap_or_default();
            warn!(stage = %cmd.stage, command = %cmd, %status, %detail, "Pipeline stage failed");
            return Err(cmd.failure(status, detail));
        }
        if statuses.iter().any(Option::is_none) {
            return Err(Error::Io(std::io::Error::other(
                "failed to collect pipeline exit status",
            )));
        }
        Ok(())
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if self.children.iter_mut().any(|(_, c)| matches!(c.try_wait(), Ok(None))) {
            self.kill();
            let _ = self.reap();
        }
    }
}
