//! Disk quota enforcement.
//!
//! An eviction pass measures the recording root and, once usage reaches the
//! quota, deletes whole clips (video and sidecar together) oldest first
//! until usage is back under `quota * (1 - margin)`. Clips still being
//! written are never touched.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::shutdown::StopSignal;
use crate::storage::{directory_usage, parse_clip_stem, split_file_name};

/// Errors from an eviction pass.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// The recording root could not be measured or listed.
    #[error("failed to scan {}: {source}", path.display())]
    DiskScanFailed {
        /// Directory being scanned.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Quota, safety margin and check cadence.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Usage at which eviction starts.
    pub quota_bytes: u64,
    /// Fraction of the quota freed below it once eviction starts.
    pub margin: f64,
    /// Time between passes.
    pub check_interval: Duration,
}

impl RetentionPolicy {
    /// Usage an eviction pass brings the root down to.
    pub fn low_water_mark(&self) -> u64 {
        let margin = self.margin.clamp(0.0, 1.0);
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let mark = (self.quota_bytes as f64 * (1.0 - margin)).floor() as u64;
        mark
    }
}

/// Decides which clips are off limits to eviction.
pub trait ProtectedClips: Send + Sync {
    /// Whether `path` belongs to a clip that must not be deleted.
    fn is_protected(&self, path: &Path) -> bool;
}

impl ProtectedClips for Vec<PathBuf> {
    fn is_protected(&self, path: &Path) -> bool {
        self.iter().any(|protected| protected == path)
    }
}

/// Each camera's open clip, checked at deletion time.
impl ProtectedClips for Vec<Arc<Camera>> {
    fn is_protected(&self, path: &Path) -> bool {
        self.iter()
            .filter_map(|camera| camera.open_clip())
            .any(|open| open.as_path() == path)
    }
}

/// Result of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Usage measured before deleting anything.
    pub usage_before: u64,
    /// Usage measured after the pass.
    pub usage_after: u64,
    /// Base paths (`<dir>/<stem>`) of the clips removed.
    pub evicted: Vec<PathBuf>,
    /// Clips skipped because they were still being written.
    pub protected: usize,
    /// Files that could not be deleted.
    pub failures: usize,
}

#[derive(Debug)]
struct ClipGroup {
    base: PathBuf,
    age_key: SystemTime,
    files: Vec<(PathBuf, u64)>,
}

/// Group every file under `root` by directory and base name.
///
/// The age key is the start time in the clip name, or the newest
/// modification time among its files when the name does not parse.
fn scan_clips(root: &Path) -> io::Result<Vec<ClipGroup>> {
    let mut groups: BTreeMap<PathBuf, ClipGroup> = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound && dir != root => continue,
            Err(err) => return Err(err),
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let path = entry.path();
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }

            let stem = split_file_name(&path).map_or_else(
                || path.file_name().map(|n| n.to_string_lossy().into_owned()),
                |(stem, _)| Some(stem.to_owned()),
            );
            let Some(stem) = stem else { continue };

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let base = dir.join(&stem);
            let group = groups.entry(base.clone()).or_insert_with(|| ClipGroup {
                age_key: parse_clip_stem(&stem)
                    .map_or(SystemTime::UNIX_EPOCH, |(_, started)| started.into()),
                base,
                files: Vec::new(),
            });
            if parse_clip_stem(&stem).is_none() {
                group.age_key = group.age_key.max(modified);
            }
            group.files.push((path, metadata.len()));
        }
    }

    let mut groups: Vec<ClipGroup> = groups.into_values().collect();
    groups.sort_by(|a, b| a.age_key.cmp(&b.age_key).then_with(|| a.base.cmp(&b.base)));
    Ok(groups)
}

/// Run one eviction pass over `root`.
pub fn evict_once(
    root: &Path,
    policy: &RetentionPolicy,
    protected: &dyn ProtectedClips,
) -> Result<EvictionReport, RetentionError> {
    let scan_failed = |source| RetentionError::DiskScanFailed {
        path: root.to_path_buf(),
        source,
    };

    let usage_before = directory_usage(root).map_err(scan_failed)?;
    let mut report = EvictionReport {
        usage_before,
        usage_after: usage_before,
        ..EvictionReport::default()
    };
    if usage_before < policy.quota_bytes {
        return Ok(report);
    }

    let target = policy.low_water_mark();
    let mut usage = usage_before;
    info!(
        usage = usage_before,
        quota = policy.quota_bytes,
        target,
        "disk quota reached, evicting oldest clips"
    );

    for group in scan_clips(root).map_err(scan_failed)? {
        if usage <= target {
            break;
        }
        if group.files.iter().any(|(path, _)| protected.is_protected(path)) {
            debug!(clip = %group.base.display(), "clip is open, skipping");
            report.protected += 1;
            continue;
        }

        let mut freed = 0;
        let mut removed = false;
        for (path, size) in &group.files {
            match fs::remove_file(path) {
                Ok(()) => {
                    freed += size;
                    removed = true;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    freed += size;
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "failed to delete clip file");
                    report.failures += 1;
                }
            }
        }
        usage = usage.saturating_sub(freed);
        if removed {
            debug!(clip = %group.base.display(), bytes = freed, "evicted clip");
            report.evicted.push(group.base);
        }
    }

    // Writers keep going during the pass, so measure again instead of
    // trusting the arithmetic.
    report.usage_after = directory_usage(root).map_err(scan_failed)?;
    info!(
        evicted = report.evicted.len(),
        usage = report.usage_after,
        failures = report.failures,
        "eviction pass finished"
    );
    Ok(report)
}

/// Thread running [`evict_once`] on a fixed interval.
pub struct DiskEvictionMonitor {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl DiskEvictionMonitor {
    /// Start monitoring `root`. The first pass runs immediately.
    pub fn spawn(
        root: PathBuf,
        policy: RetentionPolicy,
        protected: Arc<dyn ProtectedClips>,
    ) -> io::Result<Self> {
        let stop = StopSignal::new();
        let handle = thread::Builder::new().name("disk-monitor".to_owned()).spawn({
            let stop = stop.clone();
            move || loop {
                if let Err(err) = evict_once(&root, &policy, protected.as_ref()) {
                    warn!(error = %err, "eviction pass failed, retrying next interval");
                }
                if stop.wait_timeout(policy.check_interval) {
                    break;
                }
            }
        })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for the current pass to finish.
    pub fn stop(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("disk monitor panicked");
            }
        }
    }
}

impl Drop for DiskEvictionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{camera_dir, ClipPaths};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Instant;

    const CLIP_BYTES: usize = 590;
    const SIDECAR_BYTES: usize = 10;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_715_934_600 + minutes * 60, 0)
            .single()
            .expect("valid timestamp")
    }

    /// Write `count` one-minute clips alternating between two cameras.
    fn seed(root: &Path, count: i64) -> Vec<ClipPaths> {
        (0..count)
            .map(|minute| {
                let camera = if minute % 2 == 0 { "cam_lr" } else { "cam_ur" };
                fs::create_dir_all(camera_dir(root, camera)).expect("mkdir");
                let paths = ClipPaths::new(root, camera, &at(minute), "mjpeg");
                fs::write(&paths.video, vec![0u8; CLIP_BYTES]).expect("video");
                fs::write(&paths.sidecar, vec![b' '; SIDECAR_BYTES]).expect("sidecar");
                paths
            })
            .collect()
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            quota_bytes: 10_000,
            margin: 0.1,
            check_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_low_water_mark() {
        assert_eq!(policy().low_water_mark(), 9_000);
    }

    #[test]
    fn test_under_quota_deletes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), 10);

        let report = evict_once(dir.path(), &policy(), &Vec::<PathBuf>::new()).expect("pass");
        assert!(report.evicted.is_empty());
        assert_eq!(report.usage_before, 6_000);
        assert_eq!(report.usage_after, 6_000);
    }

    #[test]
    fn test_over_quota_evicts_oldest_until_margin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clips = seed(dir.path(), 20);

        let report = evict_once(dir.path(), &policy(), &Vec::<PathBuf>::new()).expect("pass");
        assert_eq!(report.usage_before, 12_000);
        assert_eq!(report.usage_after, 9_000);
        assert_eq!(report.evicted.len(), 5);

        for (index, clip) in clips.iter().enumerate() {
            let expected = index >= 5;
            assert_eq!(clip.video.exists(), expected, "clip {index} video");
            assert_eq!(clip.sidecar.exists(), expected, "clip {index} sidecar");
        }

        // Below quota now: the next passes are no-ops
        let again = evict_once(dir.path(), &policy(), &Vec::<PathBuf>::new()).expect("pass");
        assert!(again.evicted.is_empty());
        let third = evict_once(dir.path(), &policy(), &Vec::<PathBuf>::new()).expect("pass");
        assert!(third.evicted.is_empty());
        assert_eq!(third.usage_after, 9_000);
    }

    #[test]
    fn test_open_clip_is_never_evicted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clips = seed(dir.path(), 20);
        let open = vec![clips[0].video.clone()];

        let report = evict_once(dir.path(), &policy(), &open).expect("pass");
        assert_eq!(report.protected, 1);
        assert!(clips[0].video.exists());
        assert!(clips[0].sidecar.exists());
        for clip in &clips[1..6] {
            assert!(!clip.video.exists());
        }
        assert!(clips[6].video.exists());
    }

    #[test]
    fn test_unparsable_names_fall_back_to_mtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clips = seed(dir.path(), 17);
        let stray = dir.path().join("cam_lr").join("manual_export.mjpeg");
        fs::write(&stray, vec![0u8; 2_000]).expect("stray");
        let long_ago = SystemTime::UNIX_EPOCH + Duration::from_secs(86_400);
        fs::File::options()
            .write(true)
            .open(&stray)
            .expect("open")
            .set_modified(long_ago)
            .expect("set mtime");

        // 17 * 600 + 2000 = 12200; the stray file is oldest by mtime
        let report = evict_once(dir.path(), &policy(), &Vec::<PathBuf>::new()).expect("pass");
        assert!(!stray.exists());
        assert_eq!(report.evicted.len(), 3);
        assert!(!clips[1].video.exists());
        assert!(clips[2].video.exists());
    }

    #[test]
    fn test_missing_root_is_a_scan_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = evict_once(&dir.path().join("gone"), &policy(), &Vec::<PathBuf>::new());
        assert!(matches!(result, Err(RetentionError::DiskScanFailed { .. })));
    }

    #[test]
    fn test_monitor_runs_first_pass_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clips = seed(dir.path(), 20);

        let mut monitor = DiskEvictionMonitor::spawn(
            dir.path().to_path_buf(),
            policy(),
            Arc::new(Vec::<PathBuf>::new()),
        )
        .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while clips[4].video.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        monitor.stop();
        monitor.stop();

        assert!(!clips[4].video.exists());
        assert!(clips[5].video.exists());
    }
}
