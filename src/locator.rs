//! # Locator Module
//!
//! Brute-force search for the game executable. Instead of trusting a registry
//! entry or an install path, every local fixed volume is walked from its root
//! and every file named exactly like the target executable is reported.
//!
//! ## Progress
//!
//! The walk reports two kinds of [`ScanEvent`]s while it runs:
//!
//! 1.  **Directory**: the directory currently being visited.
//! 2.  **Progress**: bytes of regular files seen so far divided by the volume's
//!     used bytes. This is only an estimate, since file sizes do not map onto
//!     the disk layout, and every volume always ends with a 100% event.

use std::cmp::Ordering;
use std::path::PathBuf;

use log::{debug, info, trace};
use walkdir::{DirEntry, WalkDir};

use crate::invariant_ppt::assert_invariant;
use crate::system::{SystemOps, Volume, VolumeKind};

/// Executable name the game ships with.
pub const TARGET_EXECUTABLE: &str = "Trackmania.exe";

/// Incremental feedback emitted while a scan runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Advisory completion estimate for one volume, in whole percent.
    Progress { volume: String, percent: u8 },
    /// The walk entered this directory.
    Directory(PathBuf),
}

const CANDIDATE_NAME: &str = "Candidate file name equals the target executable";
const PROGRESS_MONOTONIC: &str = "Volume progress never decreases";

/// Walks every fixed volume and returns each path whose file name is exactly `target`.
///
/// Candidates come back in discovery order: volume enumeration order first,
/// then a pre-order walk that looks at the files of a directory before
/// descending into its subdirectories. The scan never stops at the first hit.
pub fn scan(
    system: &impl SystemOps,
    target: &str,
    mut on_event: impl FnMut(ScanEvent),
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    for volume in system.list_volumes() {
        if volume.kind != VolumeKind::Fixed {
            debug!("Skipping {:?} volume {}", volume.kind, volume.id);
            continue;
        }
        info!(
            "Scanning volume {} ({} of {} bytes used)",
            volume.id, volume.used_bytes, volume.total_bytes
        );
        scan_volume(&volume, target, &mut candidates, &mut on_event);
    }

    candidates
}

fn scan_volume(
    volume: &Volume,
    target: &str,
    candidates: &mut Vec<PathBuf>,
    on_event: &mut impl FnMut(ScanEvent),
) {
    let first_candidate = candidates.len();
    let mut scanned_bytes: u64 = 0;
    let mut progress = VolumeProgress::default();

    let walker = WalkDir::new(&volume.root)
        .same_file_system(true)
        .sort_by(files_before_dirs);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Unreadable directories and vanished entries just shrink the walk.
                debug!("Skipping entry during scan: {}", e);
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            on_event(ScanEvent::Directory(entry.path().to_path_buf()));
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        if entry.file_name() == target {
            info!("Found candidate: {:?}", entry.path());
            candidates.push(entry.path().to_path_buf());
        }

        match entry.metadata() {
            Ok(meta) => scanned_bytes = scanned_bytes.saturating_add(meta.len()),
            Err(e) => {
                trace!("Stat failed for {:?}: {}", entry.path(), e);
                continue;
            }
        }

        if let Some(percent) = progress_percent(scanned_bytes, volume.used_bytes) {
            if let Some(percent) = progress.advance(percent) {
                on_event(ScanEvent::Progress {
                    volume: volume.id.clone(),
                    percent,
                });
            }
        }
    }

    verify_candidates(&candidates[first_candidate..], volume, target);

    // Skipped files can leave the estimate short of 100.
    on_event(ScanEvent::Progress {
        volume: volume.id.clone(),
        percent: 100,
    });
}

/// Last percentage reported for a volume.
#[derive(Debug, Default)]
struct VolumeProgress {
    last_emitted: u8,
}

impl VolumeProgress {
    /// Returns `percent` when it is worth reporting, i.e. strictly above the last one.
    fn advance(&mut self, percent: u8) -> Option<u8> {
        assert_invariant(percent >= self.last_emitted, PROGRESS_MONOTONIC, "Locator");
        if percent > self.last_emitted {
            self.last_emitted = percent;
            Some(percent)
        } else {
            None
        }
    }
}

/// Every candidate found on `volume` lives under its root and carries the target name.
fn verify_candidates(found: &[PathBuf], volume: &Volume, target: &str) {
    assert_invariant(
        found.iter().all(|path| {
            path.starts_with(&volume.root) && path.file_name().is_some_and(|name| name == target)
        }),
        CANDIDATE_NAME,
        "Locator",
    );
}

/// Whole-percent estimate of `scanned` over `used`, capped at 100.
///
/// Returns `None` while the used-space figure is unknown (zero).
fn progress_percent(scanned: u64, used: u64) -> Option<u8> {
    if used == 0 {
        return None;
    }
    let percent = (u128::from(scanned) * 100 / u128::from(used)).min(100);
    Some(percent as u8)
}

/// Sibling order for the walk: files first, then directories, each by name.
fn files_before_dirs(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}
