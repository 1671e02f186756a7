//! Per-tool progress parsers.
//!
//! Each tool family prints progress in its own dialect, and the dialects
//! drift between versions. Every parser turns one stderr line into a
//! [`Sample`] and returns an empty sample for lines it does not understand.
use crate::progress::Sample;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex"));

static DD_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) bytes\b.*copied,\s*([\d.,]+) s,\s*([\d.,]+) ([kKMGTP]?i?B)/s")
        .expect("static regex")
});

static PARTCLONE_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:Completed|Complete):\s*([\d.]+)%|([\d.]+)%\s*completed").expect("static regex")
});

static PARTCLONE_REMAINING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Remaining:\s*(\d+):(\d{2}):(\d{2})").expect("static regex"));

static PARTCLONE_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\d.]+)\s*([KMGT]?i?B)/(min|s)\b").expect("static regex")
});

static GENERIC_BYTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+bytes").expect("static regex"));

static GENERIC_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("static regex"));

static GENERIC_RATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*MiB/s").expect("static regex"));

static SHRED_PASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pass (\d+)/(\d+).*?(\d+)%").expect("static regex"));

/// Turns one line of a tool's stderr into a progress sample.
pub trait ProgressParser: Send + Sync {
    fn parse(&self, line: &str) -> Sample;
}

/// Picks the parser for the program a pipeline stage runs.
pub fn parser_for(program: &Path) -> Box<dyn ProgressParser> {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.starts_with("partclone") {
        Box::new(PartcloneParser)
    } else if name == "dd" {
        Box::new(DdParser)
    } else if name == "shred" {
        Box::new(ShredParser)
    } else {
        Box::new(GenericParser)
    }
}

/// Bytes per unit for the unit strings dd and partclone print.
fn unit_multiplier(unit: &str) -> f64 {
    let binary = unit.contains('i');
    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    match unit.chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('K') => base,
        Some('M') => base.powi(2),
        Some('G') => base.powi(3),
        Some('T') => base.powi(4),
        Some('P') => base.powi(5),
        _ => 1.0,
    }
}

fn parse_decimal(text: &str) -> Option<f64> {
    text.replace(',', ".").parse().ok()
}

/// GNU dd with `status=progress`:
/// `1073741824 bytes (1.1 GB, 1.0 GiB) copied, 12.0 s, 89.5 MB/s`.
#[derive(Debug, Default)]
pub struct DdParser;

impl ProgressParser for DdParser {
    fn parse(&self, line: &str) -> Sample {
        let Some(caps) = DD_PROGRESS.captures(line.trim()) else {
            return Sample::default();
        };
        Sample {
            bytes: caps[1].parse().ok(),
            rate: parse_decimal(&caps[3]).map(|r| r * unit_multiplier(&caps[4])),
            ..Default::default()
        }
    }
}

/// partclone's status line, possibly wrapped in cursor-movement escapes:
/// `Elapsed: 00:00:05, Remaining: 00:01:10, Completed:   6.66%,   1.20GB/min,`.
#[derive(Debug, Default)]
pub struct PartcloneParser;

impl ProgressParser for PartcloneParser {
    fn parse(&self, line: &str) -> Sample {
        let line = ANSI_ESCAPE.replace_all(line, "");
        let percent = PARTCLONE_PERCENT.captures(&line).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .and_then(|m| m.as_str().parse().ok())
        });
        if percent.is_none() {
            return Sample::default();
        }
        let eta = PARTCLONE_REMAINING.captures(&line).and_then(|c| {
            let h: u64 = c[1].parse().ok()?;
            let m: u64 = c[2].parse().ok()?;
            let s: u64 = c[3].parse().ok()?;
            Some(Duration::from_secs(h * 3600 + m * 60 + s))
        });
        let rate = PARTCLONE_RATE.captures(&line).and_then(|c| {
            let value: f64 = c[1].parse().ok()?;
            let per_second = if &c[3] == "min" { value / 60.0 } else { value };
            Some(per_second * unit_multiplier(&c[2].replace("B", "iB")))
        });
        Sample {
            bytes: None,
            percent,
            rate,
            eta,
        }
    }
}

/// `shred -v`: `shred: /dev/sdb: pass 1/2 (random)...1.2GiB/7.5GiB 16%`.
///
/// Every pass restarts at zero, so the percentage is spread over all passes.
#[derive(Debug, Default)]
pub struct ShredParser;

impl ProgressParser for ShredParser {
    fn parse(&self, line: &str) -> Sample {
        let Some(caps) = SHRED_PASS.captures(line) else {
            return Sample::default();
        };
        let (Ok(pass), Ok(passes), Ok(percent)) =
            (caps[1].parse::<f64>(), caps[2].parse::<f64>(), caps[3].parse::<f64>())
        else {
            return Sample::default();
        };
        if passes < 1.0 || pass < 1.0 {
            return Sample::default();
        }
        Sample {
            percent: Some(((pass - 1.0) * 100.0 + percent) / passes),
            ..Default::default()
        }
    }
}

/// Fallback for tools without a dedicated parser: any `N bytes`, any
/// percentage, and a `MiB/s` rate.
#[derive(Debug, Default)]
pub struct GenericParser;

impl ProgressParser for GenericParser {
    fn parse(&self, line: &str) -> Sample {
        Sample {
            bytes: GENERIC_BYTES
                .captures(line)
                .and_then(|c| c[1].parse().ok()),
            percent: GENERIC_PERCENT
                .captures(line)
                .and_then(|c| c[1].parse().ok()),
            rate: GENERIC_RATE
                .captures(line)
                .and_then(|c| c[1].parse::<f64>().ok())
                .map(|r| r * 1024.0 * 1024.0),
            eta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_parser_by_program_name() {
        let sample = "Elapsed: 00:00:01, Remaining: 00:00:09, Completed:  10.00%";
        assert_eq!(
            parser_for(Path::new("/usr/sbin/partclone.ext4")).parse(sample).percent,
            Some(10.0)
        );
        assert_eq!(
            parser_for(Path::new("/bin/dd"))
                .parse("2048 bytes (2.0 kB, 2.0 KiB) copied, 1 s, 2.0 kB/s")
                .bytes,
            Some(2048)
        );
    }

    #[test]
    fn shred_passes_share_the_bar() {
        let first = ShredParser.parse("shred: /dev/sdb: pass 1/2 (random)...1.2GiB/7.5GiB 16%");
        assert_eq!(first.percent, Some(8.0));
        let second = parser_for(Path::new("/usr/bin/shred"))
            .parse("shred: /dev/sdb: pass 2/2 (000000)...7.5GiB/7.5GiB 100%");
        assert_eq!(second.percent, Some(100.0));
        assert!(ShredParser.parse("shred: /dev/sdb: pass 1/2 (random)...").is_empty());
    }

    #[test]
    fn dd_progress_line() {
        let s = DdParser.parse(
            "1073741824 bytes (1.1 GB, 1.0 GiB) copied, 12.0034 s, 89.5 MB/s",
        );
        assert_eq!(s.bytes, Some(1_073_741_824));
        assert_eq!(s.rate, Some(89_500_000.0));
    }

    #[test]
    fn dd_iec_rate_and_comma_locale() {
        let s = DdParser.parse("524288000 bytes (524 MB, 500 MiB) copied, 5,00 s, 100 MiB/s");
        assert_eq!(s.bytes, Some(524_288_000));
        assert_eq!(s.rate, Some(100.0 * 1024.0 * 1024.0));
    }

    #[test]
    fn dd_summary_lines_are_ignored() {
        assert!(DdParser.parse("2048+0 records in").is_empty());
        assert!(DdParser.parse("2048+0 records out").is_empty());
    }

    #[test]
    fn partclone_status_with_cursor_codes() {
        let line = "\x1b[AElapsed: 00:00:05, Remaining: 00:01:10, Completed:   6.66%,   1.20GB/min,";
        let s = PartcloneParser.parse(line);
        assert_eq!(s.percent, Some(6.66));
        assert_eq!(s.eta, Some(Duration::from_secs(70)));
        let rate = s.rate.unwrap();
        assert!((rate - 1.2 * 1024.0 * 1024.0 * 1024.0 / 60.0).abs() < 1.0);
    }

    #[test]
    fn partclone_rate_label_and_final_line() {
        let s = PartcloneParser
            .parse("Elapsed: 00:00:02, Remaining: 00:00:00, Completed: 100.00%, Rate:   3.05GB/min,");
        assert_eq!(s.percent, Some(100.0));
        assert!(s.rate.is_some());

        let done = PartcloneParser
            .parse("Total Time: 00:00:02, Ave. Rate:   3.0GB/min, 100.00% completed!");
        assert_eq!(done.percent, Some(100.0));
    }

    #[test]
    fn partclone_banner_is_ignored() {
        assert!(PartcloneParser.parse("Partclone v0.3.20 http://partclone.org").is_empty());
        assert!(PartcloneParser.parse("File system:  EXTFS").is_empty());
    }

    #[test]
    fn generic_patterns() {
        let s = GenericParser.parse("copied 4096 bytes, 12.5% done, 3.5 MiB/s");
        assert_eq!(s.bytes, Some(4096));
        assert_eq!(s.percent, Some(12.5));
        assert_eq!(s.rate, Some(3.5 * 1024.0 * 1024.0));
        assert!(GenericParser.parse("nothing useful").is_empty());
    }
}
