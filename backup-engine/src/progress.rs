//! Progress and throughput accounting for backup jobs.
//!
//! Progress is a single monotonic, clamped function: each phase maps its own
//! completion fraction into a fixed slice of 0..=99, and a job only reports 100
//! once it is completed.

use crate::job::JobKind;
use std::time::Duration;

/// Highest progress value a job that is not yet completed may report.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Phase whose completion is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Database,
    Files,
    Finalize,
}

/// Slice of the 0..=100 range owned by `phase` for a job of `kind`.
fn phase_span(kind: JobKind, phase: ProgressPhase) -> (f64, f64) {
    match (kind, phase) {
        (JobKind::Full, ProgressPhase::Database) => (0.0, 50.0),
        (JobKind::Full, ProgressPhase::Files) => (50.0, 100.0),
        (_, ProgressPhase::Finalize) => (100.0, 100.0),
        (_, _) => (0.0, 100.0),
    }
}

/// Map a phase-local completion fraction to a job-level percentage.
pub fn job_progress(kind: JobKind, phase: ProgressPhase, fraction: f64) -> u8 {
    let (start, end) = phase_span(kind, phase);
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let value = (start + (end - start) * fraction).floor();
    (value as u8).min(MAX_RUNNING_PROGRESS)
}

/// Combine a new estimate with the previously reported value so progress never
/// moves backwards.
pub fn advance_progress(previous: u8, estimate: u8) -> u8 {
    previous.max(estimate).min(MAX_RUNNING_PROGRESS)
}

/// Running throughput estimate over the active time of a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct Throughput {
    pub bytes: u64,
    pub active: Duration,
}

impl Throughput {
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        self.bytes = self.bytes.saturating_add(bytes);
        self.active += elapsed;
    }

    /// Average bytes per second while work was being done.
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.active.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_job_phase_slices() {
        assert_eq!(job_progress(JobKind::Full, ProgressPhase::Database, 0.0), 0);
        assert_eq!(job_progress(JobKind::Full, ProgressPhase::Database, 1.0), 50);
        assert_eq!(job_progress(JobKind::Full, ProgressPhase::Files, 0.5), 75);
        assert_eq!(job_progress(JobKind::Full, ProgressPhase::Files, 1.0), 99);
    }

    #[test]
    fn test_single_engine_uses_full_range() {
        assert_eq!(job_progress(JobKind::Database, ProgressPhase::Database, 0.5), 50);
        assert_eq!(job_progress(JobKind::Files, ProgressPhase::Files, 0.25), 25);
        assert_eq!(job_progress(JobKind::Files, ProgressPhase::Finalize, 0.0), 99);
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        assert_eq!(job_progress(JobKind::Database, ProgressPhase::Database, 7.0), 99);
        assert_eq!(job_progress(JobKind::Database, ProgressPhase::Database, f64::NAN), 0);
        assert_eq!(advance_progress(40, 30), 40);
        assert_eq!(advance_progress(40, 60), 60);
        assert_eq!(advance_progress(98, 100), 99);
    }

    #[test]
    fn test_throughput() {
        let mut t = Throughput::default();
        assert_eq!(t.bytes_per_second(), 0);
        t.record(2048, Duration::from_secs(1));
        t.record(2048, Duration::from_secs(1));
        assert_eq!(t.bytes_per_second(), 2048);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
