//! Integer-file access and small numeric helpers shared by the control core.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{ControlError, Result};

/// Reads a whitespace-trimmed ASCII decimal integer from `path`.
pub fn read_int_from_file(path: &Path) -> Result<i32> {
    let text = std::fs::read_to_string(path).map_err(|e| ControlError::io(path, e))?;
    let trimmed = text.trim();
    trimmed.parse::<i32>().map_err(|_| ControlError::Parse {
        path: path.to_path_buf(),
        text: trimmed.to_string(),
    })
}

/// Writes `value` as ASCII decimal to `path`.
///
/// The file is opened for writing and flushed before the call returns, so
/// the hardware register change is committed synchronously.
pub fn write_int_to_file(value: i32, path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| ControlError::io(path, e))?;
    file.write_all(value.to_string().as_bytes())
        .and_then(|()| file.flush())
        .map_err(|e| ControlError::io(path, e))
}

/// Simple moving average update: `avg <- ((n - 1) * avg + sample) / n`.
pub fn update_moving_avg(avg: f64, window_size: usize, sample: f64) -> f64 {
    let n = window_size.max(1) as f64;
    ((n - 1.0) * avg + sample) / n
}

/// Returns the element of `sorted` closest to `target`.
///
/// `sorted` must be sorted ascending and non-empty. Distance ties resolve
/// to the smaller element.
pub fn find_closest(target: i32, sorted: &[i32]) -> i32 {
    debug_assert!(!sorted.is_empty());
    match sorted.binary_search(&target) {
        Ok(idx) => sorted[idx],
        Err(0) => sorted[0],
        Err(idx) if idx == sorted.len() => sorted[sorted.len() - 1],
        Err(idx) => {
            let below = sorted[idx - 1];
            let above = sorted[idx];
            if above - target < target - below {
                above
            } else {
                below
            }
        }
    }
}

/// Fixed-capacity window over the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Creates a window prefilled with `value` at full capacity.
    pub fn filled(capacity: usize, value: f64) -> Self {
        let mut window = Self::new(capacity);
        for _ in 0..window.capacity {
            window.values.push_back(value);
        }
        window
    }

    /// Appends a sample, evicting the oldest when at capacity.
    pub fn append(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Largest sample currently in the window, or 0 when empty.
    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn read_write_int_round_trip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_int_to_file(128, file.path()).unwrap();
        assert_eq!(read_int_from_file(file.path()).unwrap(), 128);

        // writes fully replace the previous content
        write_int_to_file(7, file.path()).unwrap();
        assert_eq!(read_int_from_file(file.path()).unwrap(), 7);
    }

    #[test]
    fn read_int_trims_whitespace() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "  1500\n").unwrap();
        assert_eq!(read_int_from_file(file.path()).unwrap(), 1500);
    }

    #[test]
    fn read_int_reports_parse_failures() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "garbage").unwrap();
        assert!(matches!(
            read_int_from_file(file.path()),
            Err(ControlError::Parse { .. })
        ));
    }

    #[test]
    fn read_int_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("pwm1");
        assert!(matches!(
            read_int_from_file(&missing),
            Err(ControlError::Io { .. })
        ));
    }

    #[test]
    fn moving_avg_converges_toward_samples() {
        let mut avg = 0.0;
        for _ in 0..50 {
            avg = update_moving_avg(avg, 10, 1000.0);
        }
        assert!(avg > 990.0);
    }

    #[test]
    fn moving_avg_window_of_one_tracks_sample() {
        assert_eq!(update_moving_avg(500.0, 1, 42.0), 42.0);
    }

    #[test]
    fn find_closest_exact_and_neighbors() {
        let values = [0, 8, 16, 96, 104, 248];
        assert_eq!(find_closest(16, &values), 16);
        assert_eq!(find_closest(-5, &values), 0);
        assert_eq!(find_closest(255, &values), 248);
        assert_eq!(find_closest(97, &values), 96);
        assert_eq!(find_closest(103, &values), 104);
    }

    #[test]
    fn find_closest_ties_resolve_downward() {
        let values = [96, 104];
        assert_eq!(find_closest(100, &values), 96);
    }

    #[test]
    fn rolling_window_evicts_oldest() {
        let mut window = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.append(v);
        }
        assert_eq!(window.max(), 4.0);
        window.append(0.5);
        window.append(0.5);
        window.append(0.5);
        assert_eq!(window.max(), 0.5);
    }

    #[test]
    fn rolling_window_prefill() {
        let window = RollingWindow::filled(10, 20.0);
        assert_eq!(window.max(), 20.0);
    }
}
