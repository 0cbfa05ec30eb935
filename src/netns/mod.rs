//! Network namespace handles.
//!
//! `setns(2)` changes the namespace of the calling thread only. Entering a
//! namespace hands out a [`NetNsGuard`] that switches the thread back when
//! dropped, on every exit path, and that cannot leave the thread it was
//! created on. Netlink sockets stay bound to the namespace they were opened
//! in, so [`NetNs::connect`] only holds the guard while opening the socket;
//! the returned handle can then be used from any task.

use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use rtnetlink::Handle;
use tracing::{debug, error};

use crate::datapath::error::{DatapathError, Result};

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open network namespace, e.g. `/var/run/netns/<name>` or
/// `/proc/<pid>/ns/net` as handed over by the container runtime.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|reason| DatapathError::Io {
            op: format!("open network namespace {}", path.display()),
            reason,
        })?;
        Ok(Self { file, path })
    }

    /// The namespace of the calling thread.
    pub fn current() -> Result<Self> {
        Self::open(THREAD_NETNS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switch the calling thread into this namespace until the guard drops.
    pub fn enter(&self) -> Result<NetNsGuard> {
        let original = Self::current()?;
        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|source| {
            DatapathError::Namespace {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        debug!(netns = %self.path.display(), "entered network namespace");
        Ok(NetNsGuard {
            original,
            _not_send: PhantomData,
        })
    }

    /// Run `f` with the calling thread inside this namespace.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.enter()?;
        Ok(f())
    }

    /// Open an rtnetlink connection bound to this namespace.
    ///
    /// Must be called from within a tokio runtime; the connection task is
    /// spawned on it.
    pub fn connect(&self) -> Result<Handle> {
        let (connection, handle, _) = self.run(rtnetlink::new_connection)?.map_err(|reason| {
            DatapathError::Io {
                op: format!("open netlink socket in {}", self.path.display()),
                reason,
            }
        })?;
        tokio::spawn(connection);
        Ok(handle)
    }
}

/// Open an rtnetlink connection in the calling thread's namespace.
pub fn connect_current() -> Result<Handle> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(|reason| DatapathError::Io {
        op: "open netlink socket".to_string(),
        reason,
    })?;
    tokio::spawn(connection);
    Ok(handle)
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Restores the thread's previous namespace on drop.
#[must_use = "the namespace is left as soon as the guard is dropped"]
pub struct NetNsGuard {
    original: NetNs,
    // Pins the guard to the thread whose namespace it changed.
    _not_send: PhantomData<*const ()>,
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        if let Err(err) = setns(self.original.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
            // A thread stuck in the wrong namespace would silently corrupt
            // every later operation it runs.
            error!(
                netns = %self.original.path.display(),
                error = %err,
                "failed to restore network namespace"
            );
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_namespace_opens() {
        let ns = NetNs::current().unwrap();
        assert_eq!(ns.path(), Path::new(THREAD_NETNS));
        assert!(ns.as_raw_fd() >= 0);
    }

    #[test]
    fn missing_namespace_is_an_error() {
        let err = NetNs::open("/nonexistent/netns/pod").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/netns/pod"));
    }

    #[test]
    fn entering_own_namespace_runs_closure() {
        // Needs CAP_SYS_ADMIN even when the target is the current namespace.
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let ns = NetNs::current().unwrap();
        let value = ns.run(|| 42).unwrap();
        assert_eq!(value, 42);
    }
}
