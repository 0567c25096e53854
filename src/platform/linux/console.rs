//! Console socket PTY handoff (spec.md §4.1 step 4, §6 "Console socket").
//!
//! When the process spec requests a terminal and the caller supplied a
//! console socket path, a PTY pair is allocated before the init child is
//! spawned. The slave end is wired to the child's stdio; after the child
//! exists, the master end is sent to whatever is listening on the Unix
//! socket using `SCM_RIGHTS` — the OCI-defined console handoff protocol.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::pty::openpty;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

use crate::core::error::{Context as _, ErrorKind, Result};

pub struct Pty {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a fresh PTY pair (spec.md §4.1 step 4).
pub fn allocate(id: &str) -> Result<Pty> {
    let result = openpty(None, None).ctx_id("open_pty", ErrorKind::Internal, id)?;
    Ok(Pty {
        master: result.master,
        slave: result.slave,
    })
}

/// Send `master` over `console_socket` as a single auxiliary-data message
/// carrying one file descriptor (spec.md §6 "Console socket").
pub fn send_master_fd(console_socket: &Path, master: RawFd, id: &str) -> Result<()> {
    let stream = UnixStream::connect(console_socket).ctx_id("send_master_fd", ErrorKind::Internal, id)?;
    let payload = [0u8];
    let iov = [IoSlice::new(&payload)];
    let fds = [master];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .ctx_id("send_master_fd", ErrorKind::Internal, id)?;
    Ok(())
}

/// Make the PTY slave the calling process's controlling terminal and wire
/// it to stdin/stdout/stderr. Called inside the freshly cloned init child,
/// before it execs into the re-exec'd `__craterun_init` entrypoint.
pub fn attach_slave_as_stdio(slave_fd: RawFd) {
    let _ = nix::unistd::setsid();
    unsafe {
        libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0);
    }
    let _ = nix::unistd::dup2(slave_fd, 0);
    let _ = nix::unistd::dup2(slave_fd, 1);
    let _ = nix::unistd::dup2(slave_fd, 2);
    if slave_fd > 2 {
        let _ = nix::unistd::close(slave_fd);
    }
}
