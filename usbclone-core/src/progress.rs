//! Progress snapshots and the bookkeeping that turns raw tool output into them.
//!
//! A [`Progress`] is what the front-end sees: at most [`MAX_LINES`] short
//! lines and an optional ratio in `[0, 1]`. [`ProgressTracker`] keeps the
//! state needed to derive a rate and an ETA when the tool itself reports
//! only byte counts.
use crate::device::human_size;
use std::time::{Duration, Instant};

/// The most lines a single snapshot may carry.
pub const MAX_LINES: usize = 6;

const SPINNER: [&str; 4] = ["|", "/", "-", "\\"];

/// One progress snapshot. Never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Progress {
    pub lines: Vec<String>,
    pub ratio: Option<f64>,
}

impl Progress {
    /// Builds a snapshot, truncating to [`MAX_LINES`] and clamping the ratio.
    pub fn new(mut lines: Vec<String>, ratio: Option<f64>) -> Self {
        lines.truncate(MAX_LINES);
        Self {
            lines,
            ratio: ratio.map(clamp_ratio),
        }
    }
}

/// Clamps a ratio into `[0, 1]`, mapping NaN to zero.
pub fn clamp_ratio(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// What a progress parser extracted from one line of tool output.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub bytes: Option<u64>,
    pub percent: Option<f64>,
    /// Bytes per second.
    pub rate: Option<f64>,
    pub eta: Option<Duration>,
}

impl Sample {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_none() && self.percent.is_none() && self.rate.is_none()
    }
}

/// Formats an ETA as `H:MM:SS`, or `MM:SS` under an hour.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    let (hours, rem) = (secs / 3600, secs % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// Accumulates samples for one running command and renders snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    title: String,
    subtitle: Option<String>,
    total: Option<u64>,
    bytes: Option<u64>,
    percent: Option<f64>,
    rate: Option<f64>,
    eta: Option<Duration>,
    last_sample: Option<(u64, Instant)>,
    spinner: usize,
}

impl ProgressTracker {
    pub fn new(title: impl Into<String>, subtitle: Option<String>, total: Option<u64>) -> Self {
        Self {
            title: title.into(),
            subtitle,
            total: total.filter(|t| *t > 0),
            bytes: None,
            percent: None,
            rate: None,
            eta: None,
            last_sample: None,
            spinner: 0,
        }
    }

    /// The snapshot published before the command produces any output.
    pub fn initial(&self) -> Progress {
        let mut lines = vec![self.title.clone()];
        lines.extend(self.subtitle.clone());
        lines.push(if self.total.is_some() {
            format!("Wrote {} 0.0%", human_size(0))
        } else {
            "Working...".to_string()
        });
        Progress::new(lines, self.total.map(|_| 0.0))
    }

    /// Folds a parsed sample into the running state.
    ///
    /// A sample without a rate gets one derived from the byte delta since
    /// the previous sample.
    pub fn observe(&mut self, sample: Sample, now: Instant) -> Progress {
        if let Some(bytes) = sample.bytes {
            let rate = sample.rate.or_else(|| {
                let (last_bytes, last_time) = self.last_sample?;
                let elapsed = now.checked_duration_since(last_time)?.as_secs_f64();
                (bytes >= last_bytes && elapsed > 0.0)
                    .then(|| (bytes - last_bytes) as f64 / elapsed)
            });
            if let Some(rate) = rate.filter(|r| *r > 0.0) {
                self.rate = Some(rate);
                if let Some(total) = self.total.filter(|t| bytes <= *t) {
                    self.eta = Some(Duration::from_secs_f64((total - bytes) as f64 / rate));
                }
            }
            self.bytes = Some(bytes);
            self.last_sample = Some((bytes, now));
        } else if let Some(rate) = sample.rate.filter(|r| *r > 0.0) {
            self.rate = Some(rate);
        }
        if let Some(percent) = sample.percent {
            self.percent = Some(percent);
        }
        if let Some(eta) = sample.eta {
            self.eta = Some(eta);
        }
        self.render()
    }

    /// Advances the spinner without new data, so a silent tool still shows
    /// signs of life.
    pub fn tick(&mut self) -> Progress {
        self.spinner = (self.spinner + 1) % SPINNER.len();
        self.render()
    }

    pub fn bytes(&self) -> Option<u64> {
        self.bytes
    }

    /// Ratio from bytes over the known total, else from the tool's own
    /// percentage.
    pub fn ratio(&self) -> Option<f64> {
        match (self.bytes, self.total) {
            (Some(bytes), Some(total)) => Some(clamp_ratio(bytes as f64 / total as f64)),
            _ => self.percent.map(|p| clamp_ratio(p / 100.0)),
        }
    }

    fn render(&self) -> Progress {
        let mut lines = vec![format!("{} {}", self.title, SPINNER[self.spinner])];
        lines.extend(self.subtitle.clone());
        match self.bytes {
            Some(bytes) => {
                let percent = match self.total {
                    Some(total) => Some(bytes as f64 / total as f64 * 100.0),
                    None => self.percent,
                };
                match percent {
                    Some(p) => lines.push(format!("Wrote {} {p:.1}%", human_size(bytes))),
                    None => lines.push(format!("Wrote {}", human_size(bytes))),
                }
            }
            None => match self.percent {
                Some(p) => lines.push(format!("Working... {p:.1}%")),
                None => lines.push("Working...".to_string()),
            },
        }
        if let Some(rate) = self.rate {
            let mut line = format!("{}/s", human_size(rate as u64));
            if let Some(eta) = self.eta {
                line.push_str(&format!(" ETA {}", format_eta(eta)));
            }
            lines.push(line);
        }
        Progress::new(lines, self.ratio())
    }
}
