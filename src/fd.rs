//! RAII wrapper tying an OS descriptor to the fiber I/O bridge.
//!
//! An [`Fd`] owns a non-blocking kernel descriptor plus its bridge context.
//! `read` and `write` look synchronous to the calling fiber: the syscall is
//! issued directly, and only when the kernel reports `EAGAIN` does the fiber
//! park itself on the context and yield. Resumption retries the syscall —
//! with edge-triggered epoll, the retry-before-rewait discipline is what
//! keeps a wakeup delivered between syscall and suspension from being lost.
//!
//! # Invariants
//!
//! - `fd >= 0` iff the context is present; `close` tears both down exactly
//!   once and is idempotent.
//! - At most one fiber is parked on a descriptor at any instant (asserted).
//! - The waiter handle is cleared on resumption no matter who resumed the
//!   fiber; an external (cancelling) resume just runs the retry loop, which
//!   observes `EAGAIN` or completion and proceeds.

use crate::bridge::{self, FdContext, OsError, RegisterError};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Owning, move-only handle to a registered non-blocking descriptor.
pub struct Fd {
    raw: RawFd,
    ctx: Option<NonNull<FdContext>>,
}

impl Fd {
    /// Takes ownership of `raw` and registers it with the bridge.
    ///
    /// Sets `O_NONBLOCK` unless the caller states the descriptor already has
    /// it (edge-triggered epoll requires it either way). On failure the
    /// descriptor is left open for the caller; nothing is leaked.
    pub fn wrap(raw: RawFd, already_nonblocking: bool) -> Result<Fd, RegisterError> {
        assert!(raw >= 0, "wrapping a negative fd");

        if already_nonblocking {
            debug_assert!(
                {
                    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
                    flags >= 0 && flags & libc::O_NONBLOCK != 0
                },
                "fd {raw} claimed non-blocking but O_NONBLOCK is unset"
            );
        } else {
            let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
            if flags < 0 {
                return Err(OsError::last("fcntl", raw).into());
            }
            if flags & libc::O_NONBLOCK == 0 {
                let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                if rc < 0 {
                    return Err(OsError::last("fcntl", raw).into());
                }
            }
        }

        let ctx = bridge::register(raw)?;
        Ok(Fd {
            raw,
            ctx: Some(ctx),
        })
    }

    /// Creates a connected non-blocking pipe and wraps both ends.
    pub fn pipe() -> Result<(Fd, Fd), RegisterError> {
        let mut raw = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(raw.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(OsError::last("pipe2", -1).into());
        }

        let read_end = match Fd::wrap(raw[0], true) {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(raw[0]) };
                unsafe { libc::close(raw[1]) };
                return Err(err);
            }
        };
        let write_end = match Fd::wrap(raw[1], true) {
            Ok(fd) => fd,
            Err(err) => {
                drop(read_end);
                unsafe { libc::close(raw[1]) };
                return Err(err);
            }
        };

        Ok((read_end, write_end))
    }

    /// The raw descriptor, or -1 after close.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.raw
    }

    /// True until `close` (or drop) runs.
    #[inline]
    pub fn is_open(&self) -> bool {
        debug_assert!((self.raw >= 0) == self.ctx.is_some());
        self.raw >= 0
    }

    /// Reads into `buf`, suspending the calling fiber until the descriptor
    /// is readable. Returns 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, OsError> {
        assert!(self.is_open(), "read on a closed fd");
        loop {
            let n = unsafe {
                libc::read(self.raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.handle_io_error("read")?;
        }
    }

    /// Writes from `buf`, suspending the calling fiber until the descriptor
    /// accepts data. Returns the number of bytes the kernel took.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, OsError> {
        assert!(self.is_open(), "write on a closed fd");
        loop {
            let n = unsafe {
                libc::write(self.raw, buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.handle_io_error("write")?;
        }
    }

    /// Deregisters and closes. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            bridge::deregister(ctx);
        }
        if self.raw >= 0 {
            // No EPOLL_CTL_DEL beforehand: this close is what removes the
            // fd from the epoll set.
            unsafe { libc::close(self.raw) };
            self.raw = -1;
        }
    }

    /// Classifies a failed syscall: retry now (`EINTR`), park-and-retry
    /// (`EAGAIN`), or surface the error.
    fn handle_io_error(&self, syscall: &'static str) -> Result<(), OsError> {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EINTR {
            bridge::note_eintr();
            return Ok(());
        }
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            self.park_until_ready();
            return Ok(());
        }
        Err(OsError {
            errno,
            syscall,
            fd: self.raw,
        })
    }

    /// Parks the calling fiber on this descriptor's context until a
    /// readiness event (or an external resume) wakes it.
    fn park_until_ready(&self) {
        let ctx = self.ctx.expect("parking on a closed fd");
        // SAFETY: context slots are stable for the bridge's lifetime.
        let ctx = unsafe { ctx.as_ref() };

        debug_assert_eq!(ctx.fd(), self.raw);
        assert!(
            !ctx.waiter().is_valid(),
            "a second fiber tried to wait on fd {}",
            self.raw
        );

        let reactor = bridge::reactor();
        ctx.set_waiter(reactor.current_fiber_handle());
        bridge::note_suspension();
        reactor.suspend_current_fiber();
        ctx.clear_waiter();
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fd").field("raw", &self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{FiberHandle, Reactor};
    use crate::fls::FlsArea;
    use std::rc::Rc;
    use std::time::Duration;

    /// Host stub for tests that never block: all I/O here fits in the pipe
    /// buffer, so suspension is a bug.
    struct NoSuspendReactor;

    impl Reactor for NoSuspendReactor {
        fn is_open(&self) -> bool {
            true
        }
        fn current_fiber_handle(&self) -> FiberHandle {
            FiberHandle::invalid()
        }
        fn suspend_current_fiber(&self) {
            unreachable!("unexpected suspension");
        }
        fn resume_fiber(&self, _fiber: FiberHandle) {}
        fn register_idle_callback(&self, _callback: Box<dyn FnMut(Duration)>) {}
        fn fiber_fls(&self, _fiber: FiberHandle) -> Option<std::ptr::NonNull<FlsArea>> {
            None
        }
    }

    #[test]
    fn pipe_roundtrip_without_blocking() {
        bridge::open(Rc::new(NoSuspendReactor)).unwrap();
        {
            let (mut r, mut w) = Fd::pipe().unwrap();

            assert_eq!(w.write(b"hello").unwrap(), 5);
            let mut buf = [0u8; 16];
            assert_eq!(r.read(&mut buf).unwrap(), 5);
            assert_eq!(&buf[..5], b"hello");

            // EOF after the write end closes.
            w.close();
            assert_eq!(r.read(&mut buf).unwrap(), 0);
        }
        bridge::close();
    }

    #[test]
    fn close_is_idempotent() {
        bridge::open(Rc::new(NoSuspendReactor)).unwrap();
        {
            let (mut r, w) = Fd::pipe().unwrap();
            let raw = r.raw_fd();
            r.close();
            assert!(!r.is_open());
            assert_eq!(r.raw_fd(), -1);
            r.close();
            r.close();

            // The descriptor is really gone.
            let rc = unsafe { libc::fcntl(raw, libc::F_GETFL) };
            assert!(rc < 0);
            drop(w);
        }
        bridge::close();
    }

    #[test]
    fn wrap_sets_nonblocking() {
        bridge::open(Rc::new(NoSuspendReactor)).unwrap();
        {
            // pipe2 without O_NONBLOCK; wrap must add the flag.
            let mut raw = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe2(raw.as_mut_ptr(), libc::O_CLOEXEC) };
            assert_eq!(rc, 0);

            let r = Fd::wrap(raw[0], false).unwrap();
            let flags = unsafe { libc::fcntl(raw[0], libc::F_GETFL) };
            assert!(flags & libc::O_NONBLOCK != 0);

            drop(r);
            unsafe { libc::close(raw[1]) };
        }
        bridge::close();
    }

    #[test]
    fn write_to_broken_pipe_surfaces_os_error() {
        // Writing to a pipe with no read end raises EPIPE (with SIGPIPE
        // suppressed), which must surface as an error, not a retry.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        bridge::open(Rc::new(NoSuspendReactor)).unwrap();
        {
            let (r, mut w) = Fd::pipe().unwrap();
            drop(r);

            let err = w.write(b"x").unwrap_err();
            assert_eq!(err.errno, libc::EPIPE);
            assert_eq!(err.syscall, "write");
            assert_eq!(err.fd, w.raw_fd());
            let msg = err.to_string();
            assert!(msg.contains("write"), "display should name the syscall: {msg}");
        }
        bridge::close();
    }

    #[test]
    fn zero_length_write_returns_zero() {
        bridge::open(Rc::new(NoSuspendReactor)).unwrap();
        {
            let (_r, mut w) = Fd::pipe().unwrap();
            assert_eq!(w.write(&[]).unwrap(), 0);
        }
        bridge::close();
    }
}
