//! Timing sources feeding an `EventDistributor`.
//!
//! Sources never hold their own lock while invoking the callback: the
//! distributor calls into its source with its lock held, and the callback
//! takes that same lock.
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};

use crate::{system_time, Nsecs};

/// Receives the timestamp of each pulse.
pub type VsyncCallback = Arc<dyn Fn(Nsecs) + Send + Sync>;

pub trait VsyncSource: Send + Sync {
    fn set_vsync_enabled(&self, enabled: bool);
    fn set_callback(&self, callback: Option<VsyncCallback>);
    /// Shift pulses by `phase` nanoseconds relative to the display refresh.
    fn set_phase_offset(&self, phase: Nsecs);
}

#[derive(Default)]
struct HardwareState {
    enabled: bool,
    callback: Option<VsyncCallback>,
    phase: Nsecs,
}

/// Source driven by the display hardware: its vsync interrupt handler calls
/// `on_hardware_vsync`.
#[derive(Default)]
pub struct HardwareVsyncSource {
    state: Mutex<HardwareState>,
}

impl HardwareVsyncSource {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    /// Report a hardware vsync that happened at `timestamp`.
    pub fn on_hardware_vsync(&self, timestamp: Nsecs) {
        let (callback, phase) = {
            let state = self.state.lock().unwrap();
            if !state.enabled {
                return;
            }
            match &state.callback {
                Some(callback) => (Arc::clone(callback), state.phase),
                None => return,
            }
        };

        callback(timestamp + phase);
    }
}

impl VsyncSource for HardwareVsyncSource {
    fn set_vsync_enabled(&self, enabled: bool) {
        trace!("Hardware vsync {}", if enabled { "on" } else { "off" });
        self.state.lock().unwrap().enabled = enabled;
    }

    fn set_callback(&self, callback: Option<VsyncCallback>) {
        self.state.lock().unwrap().callback = callback;
    }

    fn set_phase_offset(&self, phase: Nsecs) {
        self.state.lock().unwrap().phase = phase;
    }
}

/// Returns the first `phase + k * period` deadline strictly after `now`.
pub fn next_deadline(now: Nsecs, phase: Nsecs, period: Nsecs) -> Nsecs {
    let phase = phase.rem_euclid(period);
    let k = (now - phase).div_euclid(period) + 1;
    phase + k * period
}

struct SoftwareState {
    enabled: bool,
    callback: Option<VsyncCallback>,
    phase: Nsecs,
    next_deadline: Option<Nsecs>,
    keep_running: bool,
}

struct SoftwareShared {
    state: Mutex<SoftwareState>,
    cond: Condvar,
    period: Nsecs,
}

/// Source emitting pulses from a timer thread, for displays without a
/// usable hardware vsync.
pub struct SoftwareVsyncSource {
    shared: Arc<SoftwareShared>,
    thread: Option<JoinHandle<()>>,
}

impl SoftwareVsyncSource {
    pub fn new(period: Duration) -> io::Result<Self> {
        let period = (period.as_nanos() as Nsecs).max(1);
        let shared = Arc::new(SoftwareShared {
            state: Mutex::new(SoftwareState {
                enabled: false,
                callback: None,
                phase: 0,
                next_deadline: None,
                keep_running: true,
            }),
            cond: Condvar::new(),
            period,
        });

        let thread = thread::Builder::new()
            .name("vsync-sw".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.run()
            })?;

        Ok(SoftwareVsyncSource {
            shared,
            thread: Some(thread),
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.shared.period as u64)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().unwrap().enabled
    }
}

impl SoftwareShared {
    fn run(&self) {
        debug!("Software vsync thread started, period {}ns", self.period);
        let mut state = self.state.lock().unwrap();
        while state.keep_running {
            if !state.enabled {
                state.next_deadline = None;
                state = self.cond.wait(state).unwrap();
                continue;
            }

            let now = system_time();
            let (phase, period) = (state.phase, self.period);
            let deadline = *state
                .next_deadline
                .get_or_insert_with(|| next_deadline(now, phase, period));
            if now < deadline {
                let timeout = Duration::from_nanos((deadline - now) as u64);
                state = self.cond.wait_timeout(state, timeout).unwrap().0;
                continue;
            }

            state.next_deadline = None;
            let callback = state.callback.clone();
            drop(state);
            if let Some(callback) = callback {
                callback(deadline);
            }
            state = self.state.lock().unwrap();
        }
        debug!("Software vsync thread exiting");
    }
}

impl VsyncSource for SoftwareVsyncSource {
    fn set_vsync_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if state.enabled != enabled {
            trace!("Software vsync {}", if enabled { "on" } else { "off" });
            state.enabled = enabled;
            self.shared.cond.notify_all();
        }
    }

    fn set_callback(&self, callback: Option<VsyncCallback>) {
        self.shared.state.lock().unwrap().callback = callback;
    }

    fn set_phase_offset(&self, phase: Nsecs) {
        let mut state = self.shared.state.lock().unwrap();
        state.phase = phase;
        state.next_deadline = None;
        self.shared.cond.notify_all();
    }
}

impl Drop for SoftwareVsyncSource {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.keep_running = false;
            state.callback = None;
            self.shared.cond.notify_all();
        }

        if let Some(thread) = self.thread.take() {
            // The last reference may be dropped from within the callback.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Software vsync thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    #[test]
    fn test_next_deadline() {
        assert_eq!(next_deadline(0, 0, 10), 10);
        assert_eq!(next_deadline(5, 0, 10), 10);
        assert_eq!(next_deadline(10, 0, 10), 20);
        assert_eq!(next_deadline(12, 3, 10), 13);
        assert_eq!(next_deadline(13, 3, 10), 23);
        // Phases larger than the period or negative wrap around.
        assert_eq!(next_deadline(12, 23, 10), 13);
        assert_eq!(next_deadline(12, -7, 10), 13);
    }

    #[test]
    fn test_hardware_source() {
        let source = HardwareVsyncSource::new();
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        source.set_callback(Some(Arc::new(move |ts: Nsecs| {
            sender.lock().unwrap().send(ts).unwrap();
        })));

        // Disabled: pulses are dropped.
        source.on_hardware_vsync(100);
        assert!(receiver.try_recv().is_err());

        source.set_vsync_enabled(true);
        assert!(source.is_enabled());
        source.on_hardware_vsync(200);
        assert_eq!(receiver.try_recv().unwrap(), 200);

        source.set_phase_offset(5);
        source.on_hardware_vsync(300);
        assert_eq!(receiver.try_recv().unwrap(), 305);

        source.set_callback(None);
        source.on_hardware_vsync(400);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_software_source() {
        let source = Arc::new(SoftwareVsyncSource::new(Duration::from_millis(2)).unwrap());
        assert_eq!(source.period(), Duration::from_millis(2));
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        source.set_callback(Some(Arc::new(move |ts: Nsecs| {
            let _ = sender.lock().unwrap().send(ts);
        })));

        assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());

        source.set_vsync_enabled(true);
        let first = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second > first);
        assert_eq!((second - first) % 2_000_000, 0);

        source.set_vsync_enabled(false);
        // At most one pulse may have been in flight.
        std::thread::sleep(Duration::from_millis(10));
        while receiver.try_recv().is_ok() {}
        assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_software_source_reentrant_callback() {
        let source = Arc::new(SoftwareVsyncSource::new(Duration::from_millis(1)).unwrap());
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        let weak = Arc::downgrade(&source);
        // The callback turns the source off, which must not deadlock.
        source.set_callback(Some(Arc::new(move |ts: Nsecs| {
            if let Some(source) = weak.upgrade() {
                source.set_vsync_enabled(false);
            }
            let _ = sender.lock().unwrap().send(ts);
        })));

        source.set_vsync_enabled(true);
        receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());
        assert!(!source.is_enabled());
    }
}
