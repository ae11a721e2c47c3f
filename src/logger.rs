//! Append-only sample log.
//!
//! Every emitted sample becomes one `HH:MM:SS,<kbps>Kbps\r\n` line. The file
//! is opened in append mode for every write, created on first use and never
//! truncated, so logs survive restarts of the server.

use crate::window::Sample;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{trace, warn};

/// Render a sample as a log line
pub fn format_sample(sample: &Sample) -> String {
    format!("{},{}Kbps\r\n", sample.timestamp.format("%H:%M:%S"), sample.kbps)
}

/// Render a sample for the operator console
pub fn console_line(sample: &Sample) -> String {
    format!("{} {} Kbps", sample.timestamp.format("%H:%M:%S"), sample.kbps)
}

/// Derive the log filename chosen at startup.
///
/// `<prefix>_<suffix>.log` when the operator gave a suffix, otherwise
/// `<prefix>_<HHMMSS>.log` from the start time.
pub fn log_file_name(prefix: &str, suffix: Option<&str>, now: DateTime<Local>) -> String {
    match suffix {
        Some(suffix) => format!("{prefix}_{suffix}.log"),
        None => format!("{prefix}_{}.log", now.format("%H%M%S")),
    }
}

/// Append one rendered sample to `path`, creating the file if needed.
///
/// The line goes out in a single write on an `O_APPEND` handle.
pub async fn append_sample(path: &Path, sample: &Sample) -> std::io::Result<()> {
    let line = format_sample(sample);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Shared writer for one log file.
///
/// Clones share the same lock, so appends from concurrent connections are
/// serialized and lines never interleave.
#[derive(Debug, Clone)]
pub struct SampleLogger {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl SampleLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a sample, propagating I/O failures
    pub async fn append(&self, sample: &Sample) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        append_sample(&self.path, sample).await
    }

    /// Append a sample, reporting failures instead of returning them.
    ///
    /// A sample that fails to log is lost.
    pub async fn record(&self, sample: &Sample) {
        match self.append(sample).await {
            Ok(()) => trace!(path = %self.path.display(), kbps = sample.kbps, "Sample logged"),
            Err(e) => warn!(
                path = %self.path.display(),
                kbps = sample.kbps,
                error = %e,
                "Failed to write sample to log"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_log_path(name: &str) -> PathBuf {
        let n = FILE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "tcp_meter_{}_{}_{}.log",
            name,
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn sample_at(h: u32, m: u32, s: u32, kbps: u64) -> Sample {
        Sample {
            timestamp: Local.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap(),
            kbps,
        }
    }

    fn is_well_formed(line: &str) -> bool {
        let Some(body) = line.strip_suffix("Kbps\r\n") else {
            return false;
        };
        let Some((time, kbps)) = body.split_once(',') else {
            return false;
        };
        let time = time.as_bytes();
        time.len() == 8
            && time[2] == b':'
            && time[5] == b':'
            && [0, 1, 3, 4, 6, 7].iter().all(|&i| time[i].is_ascii_digit())
            && !kbps.is_empty()
            && kbps.bytes().all(|b| b.is_ascii_digit())
    }

    fn split_lines(contents: &str) -> Vec<String> {
        contents
            .split_inclusive("\r\n")
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_format_sample() {
        assert_eq!(format_sample(&sample_at(7, 5, 3, 909)), "07:05:03,909Kbps\r\n");
        assert_eq!(format_sample(&sample_at(23, 59, 59, 0)), "23:59:59,0Kbps\r\n");
    }

    #[test]
    fn test_console_line() {
        assert_eq!(console_line(&sample_at(7, 5, 3, 909)), "07:05:03 909 Kbps");
        assert_eq!(console_line(&sample_at(0, 0, 0, 0)), "00:00:00 0 Kbps");
    }

    #[test]
    fn test_log_file_name() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 2, 9).unwrap();
        assert_eq!(log_file_name("TCP_TEST", Some("run1"), now), "TCP_TEST_run1.log");
        assert_eq!(log_file_name("TCP_TEST", None, now), "TCP_TEST_140209.log");
    }

    #[tokio::test]
    async fn test_append_creates_and_orders_lines() {
        let path = temp_log_path("order");
        let logger = SampleLogger::new(&path);

        let samples: Vec<Sample> = (0..5).map(|i| sample_at(10, 0, i, 100 * i as u64)).collect();
        for sample in &samples {
            logger.append(sample).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = split_lines(&contents);
        assert_eq!(lines.len(), samples.len());
        for (line, sample) in lines.iter().zip(&samples) {
            assert!(is_well_formed(line), "malformed line {line:?}");
            assert_eq!(line, &format_sample(sample));
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_append_never_truncates() {
        let path = temp_log_path("reopen");
        std::fs::write(&path, "12:00:00,1Kbps\r\n").unwrap();

        SampleLogger::new(&path)
            .append(&sample_at(12, 0, 1, 2))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "12:00:00,1Kbps\r\n12:00:01,2Kbps\r\n");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_record_survives_bad_path() {
        let dir = std::env::temp_dir().join(format!("tcp_meter_missing_{}", std::process::id()));
        let logger = SampleLogger::new(dir.join("nested").join("x.log"));

        assert!(logger.append(&sample_at(1, 2, 3, 4)).await.is_err());
        // Reported, not propagated
        logger.record(&sample_at(1, 2, 3, 4)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_do_not_interleave() {
        let path = temp_log_path("concurrent");
        let logger = SampleLogger::new(&path);

        let mut handles = Vec::new();
        for task in 0..8u64 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    let sample = sample_at(9, 30, 0, task * 1_000_000 + i);
                    logger.record(&sample).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = split_lines(&contents);
        assert_eq!(lines.len(), 8 * 25);
        assert!(lines.iter().all(|l| is_well_formed(l)));

        let _ = std::fs::remove_file(&path);
    }
}
