use crate::error::{Error, Result};

use libc::{F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, c_int, fcntl};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os("fcntl"));
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::last_os("fcntl"));
    }

    Ok(())
}

/// Marks a file descriptor close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFD) };
    if flags < 0 {
        return Err(Error::last_os("fcntl"));
    }

    let rc = unsafe { fcntl(fd, F_SETFD, flags | FD_CLOEXEC) };
    if rc < 0 {
        return Err(Error::last_os("fcntl"));
    }

    Ok(())
}

/// Creates a non-blocking, close-on-exec pipe, read end first.
pub(crate) fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];

    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(Error::last_os("pipe"));
    }

    // Owned from here on, so every early return closes both ends.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for fd in fds {
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
    }

    Ok((reader, writer))
}

/// Writes a single byte.
pub(crate) fn write_byte(fd: RawFd) -> io::Result<()> {
    let byte = b'T';

    let n = unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Reads a single byte, returning `false` if none was available.
pub(crate) fn read_byte(fd: RawFd) -> io::Result<bool> {
    let mut byte = 0u8;

    let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
    if n < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        return Err(error);
    }

    Ok(n == 1)
}

/// Converts a wait timeout to the milliseconds `epoll_wait` expects.
///
/// Rounds up so a timer is never polled for before it is due; `None`
/// waits forever.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = timeout.as_micros().div_ceil(1000);
            c_int::try_from(millis).unwrap_or(c_int::MAX)
        }
    }
}

/// Returns `true` for the errors a removal reports when the descriptor
/// is already gone from the readiness queue.
pub(crate) fn is_already_removed(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(libc::ENOENT | libc::EBADF))
}
