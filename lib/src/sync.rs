//! Fences, i.e. file descriptors that become readable once the hardware
//! operation they track has completed.
//!
//! A `Fence` may track several descriptors at once: merging two fences
//! produces a fence that signals only once all the merged ones have. Fences
//! are reference-counted and cheap to clone, so the same fence can be attached
//! to a buffer slot and handed to a renderer at the same time.

use std::{
    fmt,
    os::unix::io::{AsRawFd, OwnedFd},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::error;
use nix::{errno::Errno, libc};
use thiserror::Error;

use crate::{system_time, Nsecs};

macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { libc::$f($($args, )*) } {
            err if err < 0 => Err(Errno::last()),
            res => Ok(res)
        }
    }};
}

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("fence is not valid")]
    Invalid,
    #[error("error while polling fence: {0}")]
    Poll(Errno),
    #[error("fence descriptor reported an error condition")]
    Signaled,
    #[error("rendering backend failed to wait on fence")]
    BackendWait,
}

/// A synchronization fence backed by zero or more file descriptors.
///
/// A fence without descriptors is the "no fence" value: it is not valid, and
/// waiting on it returns immediately.
#[derive(Clone, Default)]
pub struct Fence {
    fds: Vec<Arc<OwnedFd>>,
}

impl Fence {
    /// Returns a fence that tracks nothing.
    pub fn no_fence() -> Self {
        Default::default()
    }

    /// Wrap `fd` into a fence. The fence takes ownership of the descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Fence {
            fds: vec![Arc::new(fd)],
        }
    }

    /// Whether this fence tracks at least one descriptor.
    pub fn is_valid(&self) -> bool {
        !self.fds.is_empty()
    }

    /// Number of descriptors tracked by this fence.
    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    /// Returns a fence that signals once both `self` and `other` have.
    ///
    /// Descriptors shared by both fences are only tracked once.
    pub fn merge(&self, other: &Fence) -> Fence {
        let mut fds = self.fds.clone();
        for fd in &other.fds {
            if !fds.iter().any(|f| Arc::ptr_eq(f, fd)) {
                fds.push(Arc::clone(fd));
            }
        }

        Fence { fds }
    }

    /// Returns whether the fence has signaled, without blocking.
    pub fn is_signaled(&self) -> Result<bool, FenceError> {
        self.wait(Some(Duration::ZERO))
    }

    /// Block until the fence signals.
    pub fn wait_forever(&self) -> Result<(), FenceError> {
        self.wait(None).map(|_| ())
    }

    /// Wait for the fence to signal, for at most `timeout` if specified.
    ///
    /// Returns `true` if the fence has signaled, `false` if the timeout
    /// expired first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|fd| libc::pollfd {
                fd: fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        while !pending.is_empty() {
            let timeout_ms: libc::c_int = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // Round up so we never wake up right before the deadline.
                    let ms = (remaining.as_nanos() + 999_999) / 1_000_000;
                    ms.min(libc::c_int::MAX as u128) as libc::c_int
                }
            };

            let nb_ready = match syscall!(poll(
                pending.as_mut_ptr(),
                pending.len() as libc::nfds_t,
                timeout_ms
            )) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("Failed to poll fence: {}", e);
                    return Err(FenceError::Poll(e));
                }
            };

            if nb_ready == 0 {
                return Ok(false);
            }

            for pfd in &pending {
                if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    return Err(FenceError::Signaled);
                }
            }
            // A hung-up descriptor will never signal otherwise.
            pending.retain(|pfd| pfd.revents & (libc::POLLIN | libc::POLLHUP) == 0);
        }

        Ok(true)
    }
}

impl From<OwnedFd> for Fence {
    fn from(fd: OwnedFd) -> Self {
        Fence::new(fd)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fds.is_empty() {
            return f.write_str("Fence(none)");
        }

        f.debug_tuple("Fence")
            .field(&self.fds.iter().map(|fd| fd.as_raw_fd()).collect::<Vec<_>>())
            .finish()
    }
}

/// When a fence signaled, as far as a `FenceTime` could tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTime {
    /// There is no fence to track.
    Invalid,
    Pending,
    Signaled(Nsecs),
}

/// A fence along with the time it was first seen signaled.
///
/// Clones share the observation, so the frame timestamps of every holder
/// agree once one of them has polled the fence.
#[derive(Debug, Clone, Default)]
pub struct FenceTime {
    fence: Fence,
    signal_time: Arc<Mutex<Option<Nsecs>>>,
}

impl FenceTime {
    pub fn new(fence: Fence) -> Self {
        FenceTime {
            fence,
            signal_time: Default::default(),
        }
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Poll the fence without blocking. The first poll that finds it
    /// signaled records the current time.
    pub fn signal_time(&self) -> Result<SignalTime, FenceError> {
        if !self.fence.is_valid() {
            return Ok(SignalTime::Invalid);
        }

        let mut signal_time = self.signal_time.lock().unwrap();
        if let Some(time) = *signal_time {
            return Ok(SignalTime::Signaled(time));
        }
        if !self.fence.is_signaled()? {
            return Ok(SignalTime::Pending);
        }

        let time = system_time();
        *signal_time = Some(time);
        Ok(SignalTime::Signaled(time))
    }
}

impl From<Fence> for FenceTime {
    fn from(fence: Fence) -> Self {
        FenceTime::new(fence)
    }
}
