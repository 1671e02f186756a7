//! Runs an engine operation on a worker thread and draws its progress.
//!
//! The engine publishes snapshots through its [`OperationContext`]; the
//! sink stores the latest one behind a mutex and the main thread polls it.
use crate::logging::LogThrottle;
use crate::terminal;
use anyhow::{Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use usbclone_core::config::Settings;
use usbclone_core::context::{OperationContext, ProcessGroups};
use usbclone_core::progress::Progress;

/// Bar resolution; ratios are drawn in tenths of a percent.
const BAR_STEPS: u64 = 1000;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_INTERVAL: Duration = Duration::from_secs(5);

type Snapshot = Arc<Mutex<Option<Progress>>>;

/// Runs `job` with a fresh context for operation `op`, blocking until it ends.
///
/// `groups` is shared with the Ctrl+C handler, so cancelling kills the
/// job's running pipeline and the job fails with the pipeline's error.
pub fn run<T, F>(op: &str, settings: Settings, groups: &ProcessGroups, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&OperationContext) -> usbclone_core::Result<T> + Send + 'static,
{
    let snapshot: Snapshot = Arc::new(Mutex::new(None));
    let sink = snapshot.clone();
    let ctx = OperationContext::new(job_id(op), op, settings, move |progress| {
        if let Ok(mut latest) = sink.lock() {
            *latest = Some(progress);
        }
    })
    .with_process_groups(groups.clone());

    let worker = thread::spawn(move || job(&ctx));

    let view = ProgressView::new(terminal::interactive())?;
    while !worker.is_finished() {
        thread::sleep(POLL_INTERVAL);
        view.update(&snapshot);
    }
    view.update(&snapshot);

    let result = worker
        .join()
        .map_err(|_| anyhow!("{op} worker thread panicked"))?;
    match result {
        Ok(value) => {
            view.finish("Done.");
            Ok(value)
        }
        Err(e) => {
            view.finish("❌ Operation failed.");
            if groups.is_terminated() {
                Err(anyhow!(e).context("operation cancelled"))
            } else {
                Err(e.into())
            }
        }
    }
}

fn job_id(op: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{op}-{secs}")
}

/// A progress bar on a terminal, throttled log lines otherwise.
struct ProgressView {
    bar: ProgressBar,
    throttle: Option<LogThrottle>,
}

impl ProgressView {
    fn new(interactive: bool) -> Result<Self> {
        if !interactive {
            return Ok(Self {
                bar: ProgressBar::hidden(),
                throttle: Some(LogThrottle::new(LOG_INTERVAL)),
            });
        }
        let bar = ProgressBar::new(BAR_STEPS);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:24} [{elapsed_precise}] [{bar:40.green/black}] {msg}")?
                .progress_chars("■ "),
        );
        Ok(Self {
            bar,
            throttle: None,
        })
    }

    fn update(&self, snapshot: &Snapshot) {
        let Some(progress) = snapshot.lock().ok().and_then(|mut latest| latest.take()) else {
            return;
        };
        let (prefix, detail) = split_lines(&progress);
        if let Some(throttle) = &self.throttle {
            if throttle.should_log() {
                info!(
                    status = %prefix,
                    detail = %detail,
                    percent = progress.ratio.map(|r| format!("{:.1}", r * 100.0)).unwrap_or_default(),
                    "Progress"
                );
            }
            return;
        }
        self.bar.set_prefix(prefix);
        self.bar.set_message(detail);
        if let Some(ratio) = progress.ratio {
            self.bar.set_position(bar_position(ratio));
        }
    }

    fn finish(&self, message: &'static str) {
        self.bar.finish_with_message(message);
    }
}

/// The first line titles the bar; the rest become its message.
fn split_lines(progress: &Progress) -> (String, String) {
    match progress.lines.split_first() {
        Some((first, rest)) => (first.clone(), rest.join(" | ")),
        None => (String::new(), String::new()),
    }
}

fn bar_position(ratio: f64) -> u64 {
    (ratio.clamp(0.0, 1.0) * BAR_STEPS as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_and_detail_lines() {
        let progress = Progress::new(
            vec!["sdb1 (1/2)".into(), "512.0MB FAT32".into(), "42%".into()],
            Some(0.21),
        );
        assert_eq!(
            split_lines(&progress),
            ("sdb1 (1/2)".to_string(), "512.0MB FAT32 | 42%".to_string())
        );
        assert_eq!(split_lines(&Progress::default()), (String::new(), String::new()));
    }

    #[test]
    fn bar_positions_are_clamped() {
        assert_eq!(bar_position(0.2105), 211);
        assert_eq!(bar_position(1.5), BAR_STEPS);
        assert_eq!(bar_position(-0.1), 0);
    }

    #[test]
    fn worker_result_and_progress_come_back() {
        let groups = ProcessGroups::new();
        let value = run("test", Settings::default(), &groups, |ctx| {
            ctx.status(["working"]);
            Ok(7)
        })
        .unwrap();
        assert_eq!(value, 7);

        let err = run::<(), _>("test", Settings::default(), &groups, |_| {
            Err(usbclone_core::Error::DeviceNotFound("sdz".into()))
        })
        .unwrap_err();
        assert!(err.to_string().contains("sdz"));
    }
}
