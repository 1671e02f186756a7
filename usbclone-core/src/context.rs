//! The per-job context threaded through every operation.
//!
//! An [`OperationContext`] carries what used to be global state in tools of
//! this kind: the progress observer, the job's tracing span, the settings,
//! and the registry of running process groups used to cancel a job.
use crate::config::Settings;
use crate::progress::{Progress, clamp_ratio};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Span, info_span, warn};

/// Callback receiving every progress snapshot of a job.
pub type ProgressSink = Box<dyn FnMut(Progress) + Send>;

/// Process groups spawned by a job. Cloning shares the registry.
///
/// This is the only cancellation mechanism: terminating the groups makes
/// the running pipeline fail, and the operation propagates that failure.
#[derive(Clone, Debug, Default)]
pub struct ProcessGroups {
    inner: Arc<Mutex<Vec<Pid>>>,
    terminated: Arc<AtomicBool>,
}

impl ProcessGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a running group. Returns `false` (and kills the group) if
    /// the registry was already terminated.
    pub fn register(&self, pgid: Pid) -> bool {
        if self.is_terminated() {
            let _ = killpg(pgid, Signal::SIGKILL);
            return false;
        }
        if let Ok(mut groups) = self.inner.lock() {
            groups.push(pgid);
        }
        true
    }

    pub fn unregister(&self, pgid: Pid) {
        if let Ok(mut groups) = self.inner.lock() {
            groups.retain(|g| *g != pgid);
        }
    }

    /// Sends `SIGTERM` to every registered group and refuses new ones.
    pub fn terminate_all(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let groups = match self.inner.lock() {
            Ok(groups) => groups.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for pgid in groups {
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                warn!(pgid = pgid.as_raw(), error = %e, "Failed to signal process group");
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug)]
struct Scale {
    base: f64,
    weight: f64,
}

/// Everything an operation needs besides its inputs.
pub struct OperationContext {
    job_id: String,
    settings: Settings,
    sink: Mutex<ProgressSink>,
    scale: Mutex<Scale>,
    span: Span,
    groups: ProcessGroups,
}

impl OperationContext {
    /// Creates a context for job `job_id` running operation `op`.
    pub fn new(
        job_id: impl Into<String>,
        op: &str,
        settings: Settings,
        sink: impl FnMut(Progress) + Send + 'static,
    ) -> Self {
        let job_id = job_id.into();
        let span = info_span!("job", id = %job_id, op);
        Self {
            job_id,
            settings,
            sink: Mutex::new(Box::new(sink)),
            scale: Mutex::new(Scale {
                base: 0.0,
                weight: 1.0,
            }),
            span,
            groups: ProcessGroups::new(),
        }
    }

    /// A context that discards progress, for callers that only need the result.
    pub fn silent(settings: Settings) -> Self {
        Self::new("silent", "silent", settings, |_| {})
    }

    /// Shares an existing registry, so the caller can cancel this job.
    pub fn with_process_groups(mut self, groups: ProcessGroups) -> Self {
        self.groups = groups;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn process_groups(&self) -> &ProcessGroups {
        &self.groups
    }

    /// Maps subsequent ratios into `[base, base + weight]` of the job.
    ///
    /// Per-partition work uses `base = i / n` and `weight = 1 / n`, so the
    /// overall ratio is `base + partition_ratio / partition_count`.
    pub fn set_scale(&self, base: f64, weight: f64) {
        if let Ok(mut scale) = self.scale.lock() {
            *scale = Scale {
                base: clamp_ratio(base),
                weight: weight.max(0.0),
            };
        }
    }

    pub fn reset_scale(&self) {
        self.set_scale(0.0, 1.0);
    }

    /// Publishes a snapshot, rescaling its ratio to the whole job.
    pub fn emit(&self, progress: Progress) {
        let scale = self.scale.lock().map(|s| *s).unwrap_or(Scale {
            base: 0.0,
            weight: 1.0,
        });
        let ratio = progress.ratio.map(|r| scale.base + r * scale.weight);
        let progress = Progress::new(progress.lines, ratio);
        if let Ok(mut sink) = self.sink.lock() {
            sink(progress);
        }
    }

    /// Publishes plain status lines without a ratio.
    pub fn status<S: Into<String>>(&self, lines: impl IntoIterator<Item = S>) {
        self.emit(Progress::new(
            lines.into_iter().map(Into::into).collect(),
            None,
        ));
    }
}
