//! Grafting a host directory subtree into a live application's mount
//! namespace.
//!
//! The sequence is rigid: a helper process running in a fresh user+mount
//! namespace opens a detached recursive clone of the source tree and hands
//! the descriptor back over a datagram socketpair; the parent reaps the
//! helper, joins the target's base user namespace and then its mount
//! namespace (that order is mandatory, reversed the mount join is refused),
//! and finally moves the detached tree onto the destination. The clone must
//! be taken before any namespace is joined or the source path would resolve
//! in the wrong namespace.

use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::cmdext::CapStdExtCommandExt;
use fn_error_context::context;
use nix::sched::CloneFlags;
use rustix::mount::{MoveMountFlags, OpenTreeFlags};
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::instance;

/// The fd number the helper's socket end is pinned to.
const HELPER_SOCKET_FD: i32 = 3;
/// The hidden argv the helper is re-executed with.
pub const HELPER_ARG: &str = "inject-helper";

/// The namespaces we try to acquire for a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NsKind {
    UserBase,
    Ipc,
    Net,
    Pid,
    Mnt,
    User,
}

impl NsKind {
    fn proc_path(&self, pid: u32) -> String {
        match self {
            // The sandbox setup records its base user namespace here
            NsKind::UserBase => format!("/proc/{pid}/root/run/.userns"),
            NsKind::Ipc => format!("/proc/{pid}/ns/ipc"),
            NsKind::Net => format!("/proc/{pid}/ns/net"),
            NsKind::Pid => format!("/proc/{pid}/ns/pid"),
            NsKind::Mnt => format!("/proc/{pid}/ns/mnt"),
            NsKind::User => format!("/proc/{pid}/ns/user"),
        }
    }

    fn self_path(&self) -> &'static str {
        match self {
            NsKind::UserBase | NsKind::User => "/proc/self/ns/user",
            NsKind::Ipc => "/proc/self/ns/ipc",
            NsKind::Net => "/proc/self/ns/net",
            NsKind::Pid => "/proc/self/ns/pid",
            NsKind::Mnt => "/proc/self/ns/mnt",
        }
    }
}

/// Open handles on a target's namespaces; entries the target does not have,
/// or that coincide with the caller's own, are absent.
#[derive(Debug, Default)]
pub struct NsHandles {
    user_base: Option<std::fs::File>,
    user: Option<std::fs::File>,
    mnt: Option<std::fs::File>,
    // Held open to keep the target's namespaces alive; only read in tests.
    #[allow(dead_code)]
    ipc: Option<std::fs::File>,
    #[allow(dead_code)]
    net: Option<std::fs::File>,
    #[allow(dead_code)]
    pid: Option<std::fs::File>,
}

fn same_file(a: &std::fs::File, b: &std::fs::File) -> Result<bool> {
    let sa = rustix::fs::fstat(a)?;
    let sb = rustix::fs::fstat(b)?;
    Ok(sa.st_dev == sb.st_dev && sa.st_ino == sb.st_ino)
}

fn open_ns(kind: NsKind, pid: u32) -> Result<Option<std::fs::File>> {
    let target = match std::fs::File::open(kind.proc_path(pid)) {
        Ok(f) => f,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            // Absent namespaces (or ones we may not see) are skipped
            tracing::debug!("no {kind:?} namespace for {pid}: {e}");
            return Ok(None);
        }
        Err(e) => return Err(e).with_context(|| format!("Opening {kind:?} of {pid}")),
    };
    let own = std::fs::File::open(kind.self_path())?;
    if same_file(&target, &own)? {
        // Shared with us, nothing to join
        return Ok(None);
    }
    Ok(Some(target))
}

/// Acquire namespace handles for `pid`.
#[context("Acquiring namespaces of {pid}")]
pub fn acquire_namespaces(pid: u32) -> Result<NsHandles> {
    Ok(NsHandles {
        user_base: open_ns(NsKind::UserBase, pid)?,
        ipc: open_ns(NsKind::Ipc, pid)?,
        net: open_ns(NsKind::Net, pid)?,
        pid: open_ns(NsKind::Pid, pid)?,
        mnt: open_ns(NsKind::Mnt, pid)?,
        user: open_ns(NsKind::User, pid)?,
    })
}

/// Entry point for the re-executed helper: unshare a fresh user+mount
/// namespace, open a detached recursive clone of `source`, and pass the
/// descriptor back over the inherited socket.
pub fn helper_main(source: &Path) -> Result<()> {
    // We were spawned with the socket pinned to a known fd.
    #[allow(unsafe_code)]
    let socket: OwnedFd = unsafe {
        use std::os::fd::FromRawFd;
        OwnedFd::from_raw_fd(HELPER_SOCKET_FD)
    };

    let uid = rustix::process::getuid();
    let gid = rustix::process::getgid();
    rustix::thread::unshare(
        rustix::thread::UnshareFlags::NEWUSER | rustix::thread::UnshareFlags::NEWNS,
    )
    .context("Unsharing user+mount namespace")?;
    std::fs::write("/proc/self/setgroups", "deny").context("Writing setgroups")?;
    std::fs::write("/proc/self/uid_map", format!("0 {} 1", uid.as_raw()))
        .context("Writing uid_map")?;
    std::fs::write("/proc/self/gid_map", format!("0 {} 1", gid.as_raw()))
        .context("Writing gid_map")?;

    let detached = rustix::mount::open_tree(
        rustix::fs::CWD,
        source,
        OpenTreeFlags::OPEN_TREE_CLONE
            | OpenTreeFlags::OPEN_TREE_CLOEXEC
            | OpenTreeFlags::AT_RECURSIVE,
    )
    .context("could not create a detached mount")?;

    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg = rustix::net::SendAncillaryBuffer::new(&mut space);
    let fds = [detached.as_fd()];
    cmsg.push(rustix::net::SendAncillaryMessage::ScmRights(&fds));
    rustix::net::sendmsg(
        &socket,
        &[std::io::IoSlice::new(b"m")],
        &mut cmsg,
        rustix::net::SendFlags::empty(),
    )
    .context("Passing mount descriptor")?;
    Ok(())
}

/// Receive the detached-tree descriptor the helper sends.
fn recv_mount_fd(sock: &UnixDatagram) -> Result<OwnedFd> {
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg = rustix::net::RecvAncillaryBuffer::new(&mut space);
    let mut buf = [0u8; 8];
    rustix::net::recvmsg(
        sock,
        &mut [std::io::IoSliceMut::new(&mut buf)],
        &mut cmsg,
        rustix::net::RecvFlags::CMSG_CLOEXEC,
    )
    .context("Receiving mount descriptor")?;
    for msg in cmsg.drain() {
        if let rustix::net::RecvAncillaryMessage::ScmRights(fds) = msg {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(fd);
            }
        }
    }
    Err(Error::NotFound("mount descriptor in helper reply".into()).into())
}

/// Spawn the helper and obtain a detached clone of `source`.
#[context("Cloning {source}")]
fn open_detached_tree(source: &Utf8Path, cancel: &CancellationToken) -> Result<OwnedFd> {
    let (ours, theirs) = UnixDatagram::pair().context("Creating socketpair")?;
    let theirs: OwnedFd = theirs.into();
    let exe = std::env::current_exe().context("Finding own executable")?;
    let mut cmd = Command::new(exe);
    cmd.arg(HELPER_ARG).arg(source.as_str());
    cmd.take_fd_n(Arc::new(theirs), HELPER_SOCKET_FD);
    tracing::debug!("exec: {cmd:?}");
    let mut child = cmd.spawn().context("Spawning helper")?;

    let fd = recv_mount_fd(&ours);
    let status = child.wait().context("Waiting for helper")?;
    if cancel.is_cancelled() {
        anyhow::bail!("Operation was cancelled");
    }
    if !status.success() {
        return Err(anyhow::anyhow!("could not create a detached mount: helper {status:?}"));
    }
    fd
}

/// Graft `source` (a host directory) at `dest` inside the mount namespace
/// of the instance, app, or PID named by `target`.
///
/// The operation is not cancellable once the namespaces are joined; a
/// cancellation observed before that reaps the helper and closes the
/// descriptor.
#[context("Injecting {source} into {target} at {dest}")]
pub fn inject(
    instances_root: &Dir,
    target: &str,
    source: &Utf8Path,
    dest: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let pid = instance::resolve_target_pid(instances_root, target)?;
    let handles = acquire_namespaces(pid)?;
    let mnt = handles
        .mnt
        .as_ref()
        .ok_or_else(|| Error::NotFound(format!("mount namespace of {pid}")))?;

    // The clone must exist before any namespace is joined.
    let detached = open_detached_tree(source, cancel)?;
    if cancel.is_cancelled() {
        anyhow::bail!("Operation was cancelled");
    }

    // user-base first, then mnt; the other direction is refused by the
    // kernel with permission denied.
    if let Some(userns) = handles.user_base.as_ref().or(handles.user.as_ref()) {
        nix::sched::setns(userns.as_fd(), CloneFlags::CLONE_NEWUSER)
            .context("Joining user namespace")?;
    }
    nix::sched::setns(mnt.as_fd(), CloneFlags::CLONE_NEWNS)
        .context("Joining mount namespace")?;

    rustix::mount::move_mount(
        detached.as_fd(),
        "",
        rustix::fs::CWD,
        dest.as_std_path(),
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )
    .context("Attaching detached mount")?;
    tracing::debug!("grafted {source} at {dest} in namespace of {pid}");
    Ok(())
}
