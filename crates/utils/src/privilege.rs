//! Privilege dropping and daemonization, the two steps of the startup
//! sequence that need direct system calls rather than portable `std` APIs.

use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("failed to resolve user '{0}'")]
    UnknownUser(String),
    #[cfg(unix)]
    #[error("privilege drop failed: {0}")]
    PrivDrop(#[from] privdrop::PrivDropError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Chroots into `chroot_dir` (if non-empty) and then drops from root to
/// `user`, group first then user, in that order - the only safe order, since
/// dropping the user id first would leave the process unable to call
/// `setgid` afterwards.
#[cfg(unix)]
pub fn drop_privileges(user: &str, chroot_dir: Option<&Path>) -> Result<(), PrivilegeError> {
    let mut drop = privdrop::PrivDrop::default().user(user);
    if let Some(dir) = chroot_dir {
        drop = drop.chroot(dir);
    }
    drop.apply()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn drop_privileges(_user: &str, _chroot_dir: Option<&Path>) -> Result<(), PrivilegeError> {
    Ok(())
}

/// Closes every inherited file descriptor numbered 3 and above, leaving
/// stdin/stdout/stderr untouched. Matches the startup-time fd hygiene step
/// that runs before any configuration or socket is touched.
#[cfg(unix)]
pub fn close_inherited_fds() {
    let max_fd = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .unwrap_or(1024) as i32;
    for fd in 3..max_fd {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(not(unix))]
pub fn close_inherited_fds() {}

/// Double-forks and calls `setsid()`, redirecting stdio to `/dev/null`, the
/// classic daemonization dance. Returns in the grandchild process only; the
/// parent and the intermediate child both call `std::process::exit(0)`.
#[cfg(unix)]
pub fn daemonize() -> io::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
    }

    setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
    }

    redirect_stdio_to_devnull()
}

#[cfg(unix)]
fn redirect_stdio_to_devnull() -> io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    unsafe {
        libc::dup2(fd, 0);
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "daemonize is only supported on unix",
    ))
}
