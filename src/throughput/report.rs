//! Transfer result formatting.

use std::time::Duration;

use serde::Serialize;

use super::megabytes_per_sec;

/// Outcome of a download run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReport {
    pub bytes: u64,
    pub elapsed: Duration,
    pub streams: usize,
}

impl TransferReport {
    pub fn megabytes_per_sec(&self) -> f64 {
        megabytes_per_sec(self.bytes, self.elapsed)
    }
}

/// Human-readable bytes: `512 B`, `1.50 MB`, `2.25 GB`.
fn format_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if b >= 1e9 {
        format!("{:.2} GB", b / 1e9)
    } else if b >= 1e6 {
        format!("{:.2} MB", b / 1e6)
    } else if b >= 1e3 {
        format!("{:.2} kB", b / 1e3)
    } else {
        format!("{bytes} B")
    }
}

/// One-line summary printed when a download finishes.
pub fn format_summary(report: &TransferReport) -> String {
    format!(
        "Received {} ({} bytes) in {:?} over {} stream{} ({:.2} MB/s)",
        format_bytes(report.bytes),
        report.bytes,
        report.elapsed,
        report.streams,
        if report.streams == 1 { "" } else { "s" },
        report.megabytes_per_sec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_summary_single_stream() {
        let report = TransferReport {
            bytes: 3_000_000,
            elapsed: Duration::from_secs(2),
            streams: 1,
        };
        let summary = format_summary(&report);
        assert!(summary.contains("3.00 MB"));
        assert!(summary.contains("3000000 bytes"));
        assert!(summary.contains("1 stream "));
        assert!(summary.contains("1.50 MB/s"));
    }

    #[test]
    fn test_format_summary_multi_stream() {
        let report = TransferReport {
            bytes: 512,
            elapsed: Duration::from_millis(500),
            streams: 8,
        };
        let summary = format_summary(&report);
        assert!(summary.contains("512 B"));
        assert!(summary.contains("8 streams"));
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(999), "999 B");
        assert_eq!(format_bytes(1_500), "1.50 kB");
        assert_eq!(format_bytes(2_250_000_000), "2.25 GB");
    }
}
