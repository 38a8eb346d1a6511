//! Utility functions shared by the training engine and the CLI

use anyhow::Result;
use std::fs;
use std::path::Path;

/// File I/O utilities
pub mod io {
    use super::*;

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Write `value` as pretty JSON
    pub fn write_json<T: serde::Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    /// Read a JSON file into `T`
    pub fn read_json<T: serde::de::DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Safe file write with atomic operation
    pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        fs::write(&temp_path, content)?;
        fs::rename(temp_path, path)?;

        Ok(())
    }
}

/// Memory utilities
pub mod memory {
    /// Resident set size of this process in bytes.
    ///
    /// Read from `/proc/self/statm`; `None` where procfs is unavailable.
    pub fn resident_set_bytes() -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }

    /// Format a byte count with a binary unit
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{bytes} B")
        } else {
            format!("{value:.1} {}", UNITS[unit])
        }
    }
}

/// Performance timing utilities
pub mod timing {
    use std::time::Duration;

    /// Exponential moving average of a duration
    #[derive(Debug, Clone)]
    pub struct DurationEma {
        smoothing: f64,
        value: Option<f64>,
    }

    impl DurationEma {
        /// Create an average where each sample has weight `smoothing`
        pub fn new(smoothing: f64) -> Self {
            Self {
                smoothing: smoothing.clamp(f64::EPSILON, 1.0),
                value: None,
            }
        }

        /// Add a sample
        pub fn update(&mut self, sample: Duration) {
            let sample = sample.as_secs_f64();
            self.value = Some(match self.value {
                Some(current) => current + self.smoothing * (sample - current),
                None => sample,
            });
        }

        /// Current average, `None` before the first sample
        pub fn get(&self) -> Option<Duration> {
            self.value.map(Duration::from_secs_f64)
        }

        /// Forget every sample
        pub fn reset(&mut self) {
            self.value = None;
        }
    }

    /// Format a duration as `HH:MM:SS`
    pub fn format_hms(duration: Duration) -> String {
        let secs = duration.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
