use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use log::{debug, trace};
use sysinfo::{Disk, Disks, Pid, ProcessStatus, System};

/// Storage classification of a mounted volume.
///
/// Only `Fixed` volumes are ever scanned for the game executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Fixed,
    Removable,
    Network,
    Optical,
    Ram,
}

/// A mounted volume together with a capacity snapshot taken when it was listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Drive letter or mount point, as shown to the user.
    pub id: String,
    /// Directory the walk starts from.
    pub root: PathBuf,
    pub kind: VolumeKind,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Abstraction for the OS capabilities the locator and runner need
/// (volumes, process table, spawning, file existence).
/// This allows us to script the process table in tests instead of running the game.
pub trait SystemOps: Send + Sync {
    /// List every mounted volume with its classification and capacity.
    fn list_volumes(&self) -> Vec<Volume>;

    /// Pids of live processes whose executable name is exactly `name`, in process-table order.
    fn list_processes_by_name(&self, name: &str) -> Vec<u32>;

    /// Forcefully terminate `pid`. Returns `false` if the signal could not be sent.
    fn kill_process(&self, pid: u32) -> bool;

    /// Start `program` detached from our stdio and return its pid.
    fn spawn_detached(&self, program: &Path, args: &[String]) -> io::Result<u32>;

    /// Check if a path exists on the file system.
    fn path_exists(&self, path: &Path) -> bool;
}

/// The real system implementation, backed by `sysinfo` and `std::process`.
#[derive(Debug, Default)]
pub struct HostSystem;

impl SystemOps for HostSystem {
    fn list_volumes(&self) -> Vec<Volume> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .map(|disk| {
                let kind = classify_disk(disk);
                trace!("Volume {:?} classified as {:?}", disk.mount_point(), kind);
                Volume {
                    id: disk.mount_point().to_string_lossy().into_owned(),
                    root: disk.mount_point().to_path_buf(),
                    kind,
                    total_bytes: disk.total_space(),
                    used_bytes: disk.total_space().saturating_sub(disk.available_space()),
                }
            })
            .collect()
    }

    fn list_processes_by_name(&self, name: &str) -> Vec<u32> {
        let mut sys = System::new();
        sys.refresh_processes();
        // Zombies linger in the table until reaped and must not count as running.
        let mut pids: Vec<u32> = sys
            .processes_by_exact_name(name)
            .filter(|p| p.status() != ProcessStatus::Zombie)
            .map(|p| p.pid().as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn kill_process(&self, pid: u32) -> bool {
        let mut sys = System::new();
        sys.refresh_processes();
        match sys.process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => {
                debug!("Process {} already gone before kill", pid);
                true
            }
        }
    }

    fn spawn_detached(&self, program: &Path, args: &[String]) -> io::Result<u32> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child.id())
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Maps a `sysinfo` disk onto our volume classes.
///
/// `sysinfo` only reports removability, so network, optical and RAM-backed
/// mounts are recognised by their file system type.
fn classify_disk(disk: &Disk) -> VolumeKind {
    if disk.is_removable() {
        return VolumeKind::Removable;
    }
    classify_file_system(&disk.file_system().to_string_lossy())
}

fn classify_file_system(fs: &str) -> VolumeKind {
    match fs.to_ascii_lowercase().as_str() {
        "nfs" | "nfs4" | "cifs" | "smbfs" | "smb3" | "afpfs" | "fuse.sshfs" | "sshfs" | "9p"
        | "webdav" => VolumeKind::Network,
        "iso9660" | "udf" | "cd9660" | "cdfs" => VolumeKind::Optical,
        "tmpfs" | "ramfs" | "devtmpfs" => VolumeKind::Ram,
        _ => VolumeKind::Fixed,
    }
}

/// A Mock System for Testing.
///
/// The process table is a script of snapshots: every `list_processes_by_name`
/// call consumes one snapshot, and the last one stays in place once reached.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct MockSystem {
    pub volumes: Vec<Volume>,
    pub process_script: Mutex<VecDeque<Vec<u32>>>,
    pub existing_paths: Mutex<Vec<PathBuf>>,
    pub spawn_pid: u32,
    pub spawn_error: Option<io::ErrorKind>,
    pub killed: Mutex<Vec<u32>>,
    pub spawned: Mutex<Vec<(PathBuf, Vec<String>)>>,
    pub path_checks: Mutex<Vec<PathBuf>>,
    pub list_calls: Mutex<usize>,
}

#[allow(dead_code)]
impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process_script(snapshots: Vec<Vec<u32>>) -> Self {
        Self {
            process_script: Mutex::new(snapshots.into()),
            ..Default::default()
        }
    }

    pub fn with_existing(self, path: impl Into<PathBuf>) -> Self {
        self.existing_paths.lock().unwrap().push(path.into());
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl SystemOps for MockSystem {
    fn list_volumes(&self) -> Vec<Volume> {
        self.volumes.clone()
    }

    fn list_processes_by_name(&self, _name: &str) -> Vec<u32> {
        *self.list_calls.lock().unwrap() += 1;
        let mut script = self.process_script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        }
    }

    fn kill_process(&self, pid: u32) -> bool {
        self.killed.lock().unwrap().push(pid);
        true
    }

    fn spawn_detached(&self, program: &Path, args: &[String]) -> io::Result<u32> {
        if let Some(kind) = self.spawn_error {
            return Err(io::Error::new(kind, "mock spawn failure"));
        }
        self.spawned
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));
        Ok(self.spawn_pid)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.path_checks.lock().unwrap().push(path.to_path_buf());
        self.existing_paths.lock().unwrap().iter().any(|p| p == path)
    }
}
