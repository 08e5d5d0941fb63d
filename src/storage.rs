//! On-disk layout of the recording root.
//!
//! Clips live at `<root>/<camera>/<camera>_<YYYYMMDD>_<HHMMSS>_<ms>.<ext>`
//! with a `.json` sidecar sharing the base name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;
use tracing::debug;

use crate::clip::{read_metadata, ClipMetadata};

/// Extension of sidecar metadata files.
pub const SIDECAR_EXTENSION: &str = "json";

/// Directory holding one camera's clips.
pub fn camera_dir(root: &Path, camera: &str) -> PathBuf {
    root.join(camera)
}

/// Base name of a clip started at `started`.
pub fn clip_stem(camera: &str, started: &DateTime<Utc>) -> String {
    format!("{camera}_{}", started.format("%Y%m%d_%H%M%S_%3f"))
}

/// Recover the camera name and start time from a clip base name.
///
/// Camera names may themselves contain underscores, so the timestamp is
/// taken from the last three fields.
pub fn parse_clip_stem(stem: &str) -> Option<(String, DateTime<Utc>)> {
    let mut fields = stem.rsplitn(4, '_');
    let millis = fields.next()?;
    let time = fields.next()?;
    let date = fields.next()?;
    let camera = fields.next()?;

    if camera.is_empty() || millis.len() != 3 || time.len() != 6 || date.len() != 8 {
        return None;
    }

    let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S").ok()?;
    let millis: u32 = millis.parse().ok()?;
    let time = time.with_nanosecond(millis * 1_000_000)?;

    Some((
        camera.to_owned(),
        Utc.from_utc_datetime(&NaiveDateTime::new(date, time)),
    ))
}

/// Video file and sidecar of one clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipPaths {
    /// Encoded video.
    pub video: PathBuf,
    /// JSON metadata.
    pub sidecar: PathBuf,
}

impl ClipPaths {
    /// Paths for a clip of `camera` started at `started`.
    pub fn new(root: &Path, camera: &str, started: &DateTime<Utc>, extension: &str) -> Self {
        let stem = clip_stem(camera, started);
        let dir = camera_dir(root, camera);
        Self {
            video: dir.join(format!("{stem}.{extension}")),
            sidecar: dir.join(format!("{stem}.{SIDECAR_EXTENSION}")),
        }
    }

    /// Sidecar path for an arbitrary video path.
    pub fn for_video(video: &Path) -> Self {
        Self {
            video: video.to_path_buf(),
            sidecar: video.with_extension(SIDECAR_EXTENSION),
        }
    }
}

/// Total bytes of regular files under `root`, recursively.
///
/// Files that disappear mid-scan are skipped: writers and the eviction pass
/// run concurrently and the figure is only ever an estimate.
pub fn directory_usage(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound && dir != root => continue,
            Err(err) => return Err(err),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };

            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

/// A recorded clip found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct ClipListing {
    /// Video file.
    pub video: PathBuf,
    /// Start time parsed from the file name.
    pub started: DateTime<Utc>,
    /// Size of the video file.
    pub size_bytes: u64,
    /// Parsed sidecar, if present and readable.
    pub metadata: Option<ClipMetadata>,
}

/// Clips recorded by `camera`, oldest first.
///
/// A camera that has not recorded anything yet has no clips.
pub fn list_clips(root: &Path, camera: &str) -> io::Result<Vec<ClipListing>> {
    let dir = camera_dir(root, camera);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut clips = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some((stem, extension)) = split_file_name(&path) else {
            continue;
        };
        if extension == SIDECAR_EXTENSION || extension.ends_with(".tmp") {
            continue;
        }
        let Some((owner, started)) = parse_clip_stem(stem) else {
            continue;
        };
        if owner != camera {
            continue;
        }
        let Ok(file) = entry.metadata() else {
            continue;
        };

        let sidecar = ClipPaths::for_video(&path).sidecar;
        let metadata = match read_metadata(&sidecar) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                debug!(clip = %path.display(), error = %err, "clip has no usable sidecar");
                None
            }
        };

        clips.push(ClipListing {
            size_bytes: file.len(),
            video: path,
            started,
            metadata,
        });
    }

    clips.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.video.cmp(&b.video)));
    Ok(clips)
}

/// Split a file name at its first dot into base name and extension.
pub(crate) fn split_file_name(path: &Path) -> Option<(&str, &str)> {
    path.file_name()?.to_str()?.split_once('.')
}
