/*!
 * Shutdown Signals
 *
 * Signal handlers may only do async-signal-safe work, so the handler just
 * writes one byte into a pipe. A regular thread blocks on the read end and
 * runs the actual shutdown from there.
 */

use std::io;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_: c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // a full pipe already holds a pending wake-up
        unsafe {
            libc::write(fd, b"X".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Read end of the signal pipe
#[derive(Debug)]
pub struct SignalPipe {
    read_fd: RawFd,
}

/// Route `signals` into a new pipe
///
/// Only one pipe is live per process; installing again redirects every
/// handler to the newest one.
pub fn install(signals: &[c_int]) -> io::Result<SignalPipe> {
    let mut fds = [0 as c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    unsafe {
        let flags = libc::fcntl(write_fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(write_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(read_fd);
            libc::close(write_fd);
            return Err(err);
        }
    }

    let old = WRITE_FD.swap(write_fd, Ordering::AcqRel);
    if old >= 0 {
        unsafe { libc::close(old) };
    }

    for &sig in signals {
        let handler = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
        if unsafe { libc::signal(sig, handler) } == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(SignalPipe { read_fd })
}

/// SIGINT and SIGTERM, the signals that ask the server to stop
pub fn install_shutdown_signals() -> io::Result<SignalPipe> {
    install(&[libc::SIGINT, libc::SIGTERM])
}

impl SignalPipe {
    /// Block until one of the installed signals arrives
    pub fn wait(&self) -> io::Result<()> {
        let mut buf = [0u8; 1];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            match n {
                1 => return Ok(()),
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        unsafe { libc::close(self.read_fd) };
    }
}
