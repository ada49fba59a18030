//! Scoped operations inside a container's mount namespace.
//!
//! Every operation runs on its own OS thread. The thread stops sharing
//! filesystem attributes with the rest of the process, joins the target mount
//! namespace and switches back before it exits, so no tokio worker is ever
//! attached to a foreign namespace.

use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use nix::errno::Errno;
use nix::sched::setns;
use nix::sched::unshare;
use nix::sched::CloneFlags;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::sys::stat::makedev;
use nix::sys::stat::mknod;
use nix::sys::stat::Mode;
use nix::sys::stat::SFlag;
use nix::unistd::Pid;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("Failed to enter mount namespace of pid {pid}")]
    EnterFailed { pid: u32 },
    #[error("Failed to create device node {path}")]
    CreateNodeFailed { path: String },
    #[error("Failed to remove device node {path}")]
    RemoveNodeFailed { path: String },
    #[error("Failed to kill process {pid}")]
    KillFailed { pid: u32 },
    #[error("Namespace worker thread failed")]
    WorkerFailed,
}

/// A character device special file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub mode: u32,
}

/// Privileged operations performed in the mount namespace of `pid`.
#[async_trait]
pub trait NamespaceExecutor: Send + Sync {
    /// Creates the node, replacing whatever exists at its path.
    async fn create_device_node(
        &self,
        pid: u32,
        node: &DeviceNode,
    ) -> Result<(), Report<NamespaceError>>;

    /// Removes the node, a missing node is not an error.
    async fn remove_device_node(&self, pid: u32, path: &Path) -> Result<(), Report<NamespaceError>>;

    /// Sends SIGKILL to every process, already exited processes are skipped.
    async fn kill_processes(&self, pid: u32, pids: &[u32]) -> Result<(), Report<NamespaceError>>;
}

/// [`NamespaceExecutor`] that joins mount namespaces with `setns(2)`.
#[derive(Debug, Clone)]
pub struct MountNamespaceExecutor {
    proc_root: PathBuf,
}

impl Default for MountNamespaceExecutor {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl MountNamespaceExecutor {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    async fn run<T, F>(&self, pid: u32, op: F) -> Result<T, Report<NamespaceError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Report<NamespaceError>> + Send + 'static,
    {
        let target = self.proc_root.join(pid.to_string()).join("ns/mnt");
        let own = self.proc_root.join("self/ns/mnt");
        run_on_thread(format!("mntns-{pid}"), move || {
            let _guard = enter_mount_namespace(pid, &target, &own)?;
            op()
        })
        .await
    }
}

/// Restores the original mount namespace of the current thread on drop.
struct NamespaceGuard {
    original: File,
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(errno) = setns(&self.original, CloneFlags::CLONE_NEWNS) {
            tracing::error!(%errno, "failed to restore original mount namespace");
        }
    }
}

fn enter_mount_namespace(
    pid: u32,
    target: &Path,
    own: &Path,
) -> Result<NamespaceGuard, Report<NamespaceError>> {
    let enter_failed = || NamespaceError::EnterFailed { pid };

    let target_ns = File::open(target)
        .change_context_lazy(enter_failed)
        .attach_printable_lazy(|| format!("open {}", target.display()))?;
    let original = File::open(own)
        .change_context_lazy(enter_failed)
        .attach_printable_lazy(|| format!("open {}", own.display()))?;

    unshare(CloneFlags::CLONE_FS)
        .change_context_lazy(enter_failed)
        .attach_printable("unshare filesystem attributes")?;
    setns(&target_ns, CloneFlags::CLONE_NEWNS)
        .change_context_lazy(enter_failed)
        .attach_printable("setns")?;

    tracing::debug!(pid, "entered mount namespace");
    Ok(NamespaceGuard { original })
}

/// Runs `op` on a dedicated thread and waits for its result.
async fn run_on_thread<T, F>(name: String, op: F) -> Result<T, Report<NamespaceError>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Report<NamespaceError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _ = tx.send(op());
        })
        .change_context(NamespaceError::WorkerFailed)?;

    rx.await.change_context(NamespaceError::WorkerFailed)?
}

fn create_node(node: &DeviceNode) -> Result<(), Report<NamespaceError>> {
    let create_failed = || NamespaceError::CreateNodeFailed {
        path: node.path.display().to_string(),
    };

    match std::fs::remove_file(&node.path) {
        Ok(()) => tracing::debug!(path = %node.path.display(), "replacing existing device node"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Report::new(e).change_context(create_failed())),
    }

    let dev = makedev(u64::from(node.major), u64::from(node.minor));
    mknod(
        &node.path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(node.mode),
        dev,
    )
    .change_context_lazy(create_failed)?;

    // mknod is subject to the umask
    std::fs::set_permissions(&node.path, std::fs::Permissions::from_mode(node.mode))
        .change_context_lazy(create_failed)?;
    Ok(())
}

fn remove_node(path: &Path) -> Result<(), Report<NamespaceError>> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "device node already absent");
            Ok(())
        }
        Err(e) => Err(Report::new(e).change_context(NamespaceError::RemoveNodeFailed {
            path: path.display().to_string(),
        })),
    }
}

fn kill_all(pids: &[u32]) -> Result<(), Report<NamespaceError>> {
    for &pid in pids {
        let Ok(raw) = i32::try_from(pid) else {
            return Err(Report::new(NamespaceError::KillFailed { pid }));
        };
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => tracing::info!(pid, "killed process"),
            Err(Errno::ESRCH) => tracing::debug!(pid, "process already exited"),
            Err(errno) => {
                return Err(Report::new(errno).change_context(NamespaceError::KillFailed { pid }))
            }
        }
    }
    Ok(())
}

#[async_trait]
impl NamespaceExecutor for MountNamespaceExecutor {
    #[tracing::instrument(skip(self, node), fields(path = %node.path.display()))]
    async fn create_device_node(
        &self,
        pid: u32,
        node: &DeviceNode,
    ) -> Result<(), Report<NamespaceError>> {
        let node = node.clone();
        self.run(pid, move || create_node(&node)).await
    }

    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    async fn remove_device_node(&self, pid: u32, path: &Path) -> Result<(), Report<NamespaceError>> {
        let path = path.to_path_buf();
        self.run(pid, move || remove_node(&path)).await
    }

    #[tracing::instrument(skip(self))]
    async fn kill_processes(&self, pid: u32, pids: &[u32]) -> Result<(), Report<NamespaceError>> {
        let pids = pids.to_vec();
        self.run(pid, move || kill_all(&pids)).await
    }
}
