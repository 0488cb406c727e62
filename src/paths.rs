//! Shared-memory root and pid-scoped path helpers.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

/// Root directory for shared-memory artifacts (control sockets, follower
/// channel rings).
///
/// Uses `CPLANE_SHM_ROOT` if set, otherwise `/dev/shm/cplane`.
pub fn shm_root() -> PathBuf {
    if let Some(dir) = thread_local_shm_root_override() {
        return dir;
    }

    if let Ok(dir) = std::env::var("CPLANE_SHM_ROOT") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    PathBuf::from("/dev/shm").join("cplane")
}

/// Pid-scoped subdirectory of the shm root.
pub fn pid_dir(pid: u32) -> PathBuf {
    shm_root().join(pid.to_string())
}

/// Resolve a control-socket name.
///
/// Absolute paths are used as-is; relative names land under this process's
/// pid directory.
pub fn socket_path(name: &str) -> PathBuf {
    let name = Path::new(name);
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        pid_dir(std::process::id()).join(name)
    }
}

/// Ring file a follower creates and the leader opens.
pub fn follower_channel_path(pid: u32) -> PathBuf {
    pid_dir(pid).join("config-follower-channel")
}

#[doc(hidden)]
pub struct ShmRootOverride {
    prev: Option<PathBuf>,
}

impl ShmRootOverride {
    pub fn new(path: Option<PathBuf>) -> Self {
        let prev = SHM_ROOT_OVERRIDE.with(|cell| cell.replace(path));
        Self { prev }
    }
}

impl Drop for ShmRootOverride {
    fn drop(&mut self) {
        let prev = self.prev.take();
        SHM_ROOT_OVERRIDE.with(|cell| {
            cell.replace(prev);
        });
    }
}

/// Redirect the shm root for the current thread, restoring on drop.
#[doc(hidden)]
pub fn override_shm_root_for_tests(path: Option<PathBuf>) -> ShmRootOverride {
    ShmRootOverride::new(path)
}

fn thread_local_shm_root_override() -> Option<PathBuf> {
    SHM_ROOT_OVERRIDE.with(|cell| cell.borrow().clone())
}

thread_local! {
    static SHM_ROOT_OVERRIDE: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}
