//! A software fence timeline.
//!
//! Each fence is one end of a socket pair. Signaling a fence writes a byte
//! to the other end, which makes the fence's descriptor readable. Fences
//! whose timeline is dropped signal as well, since their peer is closed.
use std::io::Write;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;

use anyhow::Result;
use flingr::sync::Fence;
use log::trace;

pub struct FenceTimeline {
    name: String,
    value: u64,
    /// Signaling ends of the fences not signaled yet, with their point.
    pending: Vec<(u64, UnixStream)>,
}

impl FenceTimeline {
    pub fn new<S: Into<String>>(name: S) -> Self {
        FenceTimeline {
            name: name.into(),
            value: 0,
            pending: Vec::new(),
        }
    }

    /// Current value of the timeline. Every fence created for a point lower
    /// or equal to it has signaled.
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Create a fence that signals once the timeline reaches `point`. The
    /// fence is signaled right away if the timeline is already past it.
    pub fn create_fence(&mut self, point: u64) -> Result<Fence> {
        let (fence_end, mut signal_end) = UnixStream::pair()?;
        if point <= self.value {
            signal_end.write_all(&[1])?;
        } else {
            self.pending.push((point, signal_end));
        }

        Ok(Fence::new(OwnedFd::from(fence_end)))
    }

    /// Move the timeline forward by `steps`.
    pub fn advance(&mut self, steps: u64) -> Result<()> {
        self.signal_to(self.value.saturating_add(steps))
    }

    /// Signal every fence up to `value`. Timelines never go back.
    pub fn signal_to(&mut self, value: u64) -> Result<()> {
        if value <= self.value {
            return Ok(());
        }
        self.value = value;

        let (signaled, pending): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|(point, _)| *point <= value);
        self.pending = pending;

        for (point, mut signal_end) in signaled {
            trace!("{}: signaling point {}", self.name, point);
            signal_end.write_all(&[1])?;
        }

        Ok(())
    }
}
