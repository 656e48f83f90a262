//! Output file naming.
//!
//! Devices do not format file paths themselves; they are handed a
//! [`PathStrategy`] at construction. Two layouts are in use:
//!
//! - [`DatedPath`]: `<root>/<raw>/<subsystem>/<yyyy>/<mm>/<dd>/<uid>`, used by
//!   the streaming box, its trigger output and the area detectors.
//! - [`ShortPath`]: `<directory>/<prefix><6 hex>`, used by pizza-box channels
//!   whose file path register only holds a short string.
//!
//! Both can carry a length limit checked when the device stages.

use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};
use tracing::error;

use crate::error::{AppResult, FlyerError};

/// A formatted output path split into resource root and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPath {
    /// Resource root
    pub root: String,
    /// Full path of the file without extension
    pub full: String,
}

impl OutputPath {
    /// `full` relative to `root`.
    pub fn relative(&self) -> String {
        match Path::new(&self.full).strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => self.full.clone(),
        }
    }
}

/// Strategy for naming the file of one acquisition.
pub trait PathStrategy: Send + Sync {
    /// Path for an acquisition identified by `uid`, started at `now`.
    fn output_path(&self, uid: &str, now: DateTime<Utc>) -> OutputPath;

    /// Maximum length accepted by the hardware register, if any.
    fn max_len(&self) -> Option<usize> {
        None
    }

    /// Format and check against [`max_len`](Self::max_len).
    fn checked_path(&self, device: &str, uid: &str, now: DateTime<Utc>) -> AppResult<OutputPath> {
        let path = self.output_path(uid, now);
        if let Some(limit) = self.max_len() {
            let len = path.full.chars().count();
            if len > limit {
                error!(
                    device,
                    path = %path.full,
                    len,
                    limit,
                    invariant = "file path fits hardware register",
                    "Output path too long"
                );
                return Err(FlyerError::PathTooLong {
                    device: device.to_string(),
                    path: path.full,
                    len,
                    limit,
                });
            }
        }
        Ok(path)
    }
}

fn join(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

/// `<root>/<raw>/<subsystem>/<yyyy>/<mm>/<dd>/<uid>`
#[derive(Debug, Clone)]
pub struct DatedPath {
    root: PathBuf,
    raw_subdir: String,
    subsystem: String,
    max_len: Option<usize>,
}

impl DatedPath {
    /// Dated layout below `root/raw_subdir/subsystem`.
    pub fn new(root: impl Into<PathBuf>, raw_subdir: &str, subsystem: &str) -> Self {
        Self {
            root: root.into(),
            raw_subdir: raw_subdir.to_string(),
            subsystem: subsystem.to_string(),
            max_len: None,
        }
    }

    /// Enforce a length limit.
    pub fn with_max_len(mut self, limit: Option<usize>) -> Self {
        self.max_len = limit;
        self
    }

    /// Directory holding files for `now`.
    pub fn directory(&self, now: DateTime<Utc>) -> PathBuf {
        self.root
            .join(&self.raw_subdir)
            .join(&self.subsystem)
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()))
    }
}

impl PathStrategy for DatedPath {
    fn output_path(&self, uid: &str, now: DateTime<Utc>) -> OutputPath {
        OutputPath {
            root: self.root.to_string_lossy().into_owned(),
            full: join(&self.directory(now), uid),
        }
    }

    fn max_len(&self) -> Option<usize> {
        self.max_len
    }
}

/// `<directory>/<prefix><first 6 chars of uid>`
#[derive(Debug, Clone)]
pub struct ShortPath {
    directory: PathBuf,
    prefix: String,
    max_len: Option<usize>,
}

impl ShortPath {
    /// Short names in `directory`.
    pub fn new(directory: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.to_string(),
            max_len: None,
        }
    }

    /// Enforce a length limit.
    pub fn with_max_len(mut self, limit: Option<usize>) -> Self {
        self.max_len = limit;
        self
    }
}

impl PathStrategy for ShortPath {
    fn output_path(&self, uid: &str, _now: DateTime<Utc>) -> OutputPath {
        let short: String = uid.chars().take(6).collect();
        OutputPath {
            root: self.directory.to_string_lossy().into_owned(),
            full: join(&self.directory, &format!("{}{short}", self.prefix)),
        }
    }

    fn max_len(&self) -> Option<usize> {
        self.max_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn dated_paths_use_zero_padded_dates() {
        let strategy = DatedPath::new("/nsls2/data/qas-new/legacy", "raw", "apb");
        let path = strategy.output_path("abcd-1234", day());
        assert_eq!(
            path.full,
            "/nsls2/data/qas-new/legacy/raw/apb/2024/03/07/abcd-1234"
        );
        assert_eq!(path.root, "/nsls2/data/qas-new/legacy");
        assert_eq!(path.relative(), "raw/apb/2024/03/07/abcd-1234");
    }

    #[test]
    fn short_paths_keep_six_characters() {
        let strategy = ShortPath::new("/epics/pb_data", "en_").with_max_len(Some(40));
        let path = strategy.checked_path("pb9_enc1", "0123456789", day()).unwrap();
        assert_eq!(path.full, "/epics/pb_data/en_012345");
    }

    #[test]
    fn long_paths_are_rejected() {
        let strategy = ShortPath::new("/a/very/long/directory/name/for/pizza/box", "en_")
            .with_max_len(Some(40));
        let err = strategy.checked_path("pb9_enc1", "0123456789", day()).unwrap_err();
        assert!(matches!(err, FlyerError::PathTooLong { limit: 40, .. }));
    }
}
