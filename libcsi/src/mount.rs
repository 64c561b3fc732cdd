//! Host mount primitives.
//!
//! [`Mounter`] is the seam between the lifecycle logic and the kernel: the
//! [`HostMounter`] implementation issues real `mount(2)` / `umount(2)` calls
//! and reads `/proc/self/mountinfo`, while tests substitute an in-memory
//! table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::MsFlags;
use tracing::debug;

use crate::error::CsiError;

/// Default location of the per-process mount table.
pub const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// What a publish target currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Nothing is mounted at the target.
    Unbound,
    /// The target is a bind of the expected source directory.
    Source,
    /// Something else is mounted at the target; carries its description.
    Other(String),
}

/// Bind mounts, unmounts and mount-table lookups.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Bind `source` onto `target` read-only.
    async fn bind_read_only(&self, source: &Path, target: &Path) -> Result<(), CsiError>;

    /// Unmount `target`.  A target that is not mounted or does not exist is
    /// already in the desired state and yields `Ok`.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    /// Whether `target` is a bind of `source`, of something else, or of
    /// nothing.
    async fn binding(&self, source: &Path, target: &Path) -> Result<Binding, CsiError>;
}

/// [`Mounter`] that talks to the host kernel.
#[derive(Debug, Clone)]
pub struct HostMounter {
    mountinfo: PathBuf,
}

impl HostMounter {
    pub fn new() -> Self {
        Self::with_mountinfo(PROC_SELF_MOUNTINFO)
    }

    /// Read the mount table from a different file, e.g. another process's
    /// `mountinfo`.
    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: path.into(),
        }
    }
}

impl Default for HostMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mounter for HostMounter {
    async fn bind_read_only(&self, source: &Path, target: &Path) -> Result<(), CsiError> {
        let failed = |step: &str, e: Errno| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("{step}: {e}"),
        };

        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| failed("bind", e))?;

        // The kernel ignores MS_RDONLY on the initial bind; only a remount
        // makes the bind actually read-only.
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| failed("remount read-only", e))?;

        debug!(source = %source.display(), target = %target.display(), "read-only bind mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        match nix::mount::umount(target) {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL | Errno::ENOENT) => {
                debug!(target = %target.display(), "not mounted");
                Ok(())
            }
            Err(e) => Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn binding(&self, source: &Path, target: &Path) -> Result<Binding, CsiError> {
        let contents = tokio::fs::read_to_string(&self.mountinfo)
            .await
            .map_err(|e| CsiError::Internal(format!("read {}: {e}", self.mountinfo.display())))?;
        Ok(classify_binding(&parse_mountinfo(&contents), source, target))
    }
}

/// One line of a mountinfo table.
///
/// Line format (see `proc(5)`):
///
/// ```text
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw
/// ^id ^parent ^dev ^root ^mount point ...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// `major:minor` of the filesystem.
    pub device: String,
    /// Directory of that filesystem exposed at the mount point.
    pub root: PathBuf,
    /// Where it is visible in this process.
    pub mount_point: PathBuf,
}

/// Parse mountinfo-formatted `contents`, skipping malformed lines.
pub fn parse_mountinfo(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ').skip(2);
            let device = fields.next()?;
            let root = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: device.to_owned(),
                root: PathBuf::from(unescape(root)),
                mount_point: PathBuf::from(unescape(mount_point)),
            })
        })
        .collect()
}

/// The `(device, root)` pair a bind mount of `path` would show.
///
/// `path` lives on the mount with the longest mount point containing it; a
/// bind of it exposes that mount's root joined with the rest of the path.
/// Among equally long mount points the last one is visible.
pub fn resolve_bind_root(entries: &[MountEntry], path: &Path) -> Option<(String, PathBuf)> {
    let mut best: Option<(&MountEntry, &Path)> = None;
    for entry in entries {
        let Ok(rest) = path.strip_prefix(&entry.mount_point) else {
            continue;
        };
        let depth = entry.mount_point.components().count();
        if best.is_none_or(|(b, _)| depth >= b.mount_point.components().count()) {
            best = Some((entry, rest));
        }
    }
    best.map(|(entry, rest)| {
        let root = if rest.as_os_str().is_empty() {
            entry.root.clone()
        } else {
            entry.root.join(rest)
        };
        (entry.device.clone(), root)
    })
}

/// Compare what is mounted at `target` with what a bind of `source` shows.
///
/// When several mounts are stacked on `target` the last one is visible, so
/// the last matching line decides.
pub fn classify_binding(entries: &[MountEntry], source: &Path, target: &Path) -> Binding {
    let Some(bound) = entries.iter().rev().find(|e| e.mount_point == target) else {
        return Binding::Unbound;
    };
    let others: Vec<MountEntry> = entries
        .iter()
        .filter(|e| e.mount_point != target)
        .cloned()
        .collect();
    match resolve_bind_root(&others, source) {
        Some((device, root)) if device == bound.device && root == bound.root => Binding::Source,
        _ => Binding::Other(format!("{} on {}", bound.root.display(), bound.device)),
    }
}

/// Decode the `\ooo` octal escapes the kernel uses for space, tab, newline
/// and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = u32::from(bytes[i + 1] - b'0') * 64
                + u32::from(bytes[i + 2] - b'0') * 8
                + u32::from(bytes[i + 3] - b'0');
            if let Ok(b) = u8::try_from(value) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
