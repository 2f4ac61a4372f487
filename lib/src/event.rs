//! Distribution of display events to any number of connections.
//!
//! The `EventDistributor` runs a dedicated thread that waits for pulses from
//! its `VsyncSource` and forwards them to the connections that asked for
//! them. A connection either receives the next pulse only (one-shot), or
//! every n-th pulse (continuous). Hotplug and screen power events are
//! broadcast to every connection regardless of its delivery mode.
//!
//! The timing source is only enabled while at least one connection wants
//! vsync events. When the screen is off, or when the hardware source stops
//! producing pulses, the distributor synthesizes them from its own timeouts.
pub mod connection;
pub mod source;

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write};
use std::io;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use enumn::N;
use log::{debug, error, trace, warn};
use thiserror::Error;

pub use connection::{ChannelTransport, ConnectionId, EventConnection, EventTransport, PostError};
pub use source::{HardwareVsyncSource, SoftwareVsyncSource, VsyncCallback, VsyncSource};

use crate::{system_time, Nsecs};

/// Displays the distributor produces events for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum DisplayType {
    Primary = 0,
    External = 1,
}

pub const NUM_BUILTIN_DISPLAY_TYPES: usize = 2;

const BUILTIN_DISPLAYS: [DisplayType; NUM_BUILTIN_DISPLAY_TYPES] =
    [DisplayType::Primary, DisplayType::External];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayEvent {
    Vsync {
        display: DisplayType,
        timestamp: Nsecs,
        /// Number of pulses received for this display so far.
        count: u32,
    },
    Hotplug {
        display: DisplayType,
        timestamp: Nsecs,
        connected: bool,
    },
    ScreenPower {
        display: DisplayType,
        timestamp: Nsecs,
        on: bool,
    },
}

impl DisplayEvent {
    pub fn display(&self) -> DisplayType {
        match *self {
            DisplayEvent::Vsync { display, .. }
            | DisplayEvent::Hotplug { display, .. }
            | DisplayEvent::ScreenPower { display, .. } => display,
        }
    }

    pub fn timestamp(&self) -> Nsecs {
        match *self {
            DisplayEvent::Vsync { timestamp, .. }
            | DisplayEvent::Hotplug { timestamp, .. }
            | DisplayEvent::ScreenPower { timestamp, .. } => timestamp,
        }
    }
}

/// Which vsync events a connection receives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// No vsync events.
    #[default]
    Disabled,
    /// The next vsync event only, after which the connection goes back to
    /// `Disabled`.
    OneShotArmed,
    /// Every n-th vsync event.
    Continuous(NonZeroU32),
}

impl DeliveryMode {
    /// Integer encoding of the mode: -1 when disabled, 0 for a one-shot, and
    /// the rate for continuous delivery.
    pub fn count(self) -> i32 {
        match self {
            DeliveryMode::Disabled => -1,
            DeliveryMode::OneShotArmed => 0,
            DeliveryMode::Continuous(rate) => rate.get().min(i32::MAX as u32) as i32,
        }
    }

    pub fn from_count(count: i32) -> Self {
        match count {
            c if c < 0 => DeliveryMode::Disabled,
            c => NonZeroU32::new(c as u32).map_or(DeliveryMode::OneShotArmed, DeliveryMode::Continuous),
        }
    }

    pub fn wants_vsync(self) -> bool {
        self != DeliveryMode::Disabled
    }
}

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("connection is not registered")]
    NotRegistered,
    #[error("connection is already registered")]
    AlreadyRegistered,
    #[error("connection belongs to another distributor")]
    ForeignConnection,
    #[error("distributor has been stopped")]
    Stopped,
}

/// Hook called whenever a connection asks for the next vsync, so the
/// hardware can be resynchronized if needed.
pub type ResyncCallback = Arc<dyn Fn() + Send + Sync>;

pub struct DistributorConfig {
    name: String,
    software_vsync_period: Duration,
    hardware_vsync_timeout: Duration,
    resync: Option<ResyncCallback>,
}

impl DistributorConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        DistributorConfig {
            name: name.into(),
            software_vsync_period: Duration::from_millis(16),
            hardware_vsync_timeout: Duration::from_millis(1000),
            resync: None,
        }
    }

    /// Interval of the pulses synthesized while the screen is off.
    pub fn software_vsync_period(mut self, period: Duration) -> Self {
        self.software_vsync_period = period;
        self
    }

    /// Time without a hardware pulse after which one is synthesized.
    pub fn hardware_vsync_timeout(mut self, timeout: Duration) -> Self {
        self.hardware_vsync_timeout = timeout;
        self
    }

    pub fn resync_callback<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.resync = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for DistributorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributorConfig")
            .field("name", &self.name)
            .field("software_vsync_period", &self.software_vsync_period)
            .field("hardware_vsync_timeout", &self.hardware_vsync_timeout)
            .field("resync", &self.resync.is_some())
            .finish()
    }
}

struct ConnectionEntry {
    connection: Weak<EventConnection>,
    mode: DeliveryMode,
}

/// Latest pulse of a display.
#[derive(Clone, Copy, Default)]
struct VsyncRecord {
    /// Set until the pulse is dispatched.
    timestamp: Option<Nsecs>,
    count: u32,
}

/// Outcome of looking for something to deliver.
#[derive(Default)]
struct Pass {
    event: Option<DisplayEvent>,
    targets: Vec<Arc<EventConnection>>,
    /// A pulse has been consumed by this pass.
    had_vsync: bool,
    /// At least one connection wants vsync events.
    wants_vsync: bool,
}

struct DistributorState {
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    pending_events: VecDeque<DisplayEvent>,
    vsync: [VsyncRecord; NUM_BUILTIN_DISPLAY_TYPES],
    use_software_vsync: bool,
    vsync_enabled: bool,
    debug_vsync_enabled: bool,
    keep_running: bool,
}

impl DistributorState {
    fn new() -> Self {
        DistributorState {
            connections: BTreeMap::new(),
            pending_events: VecDeque::new(),
            vsync: Default::default(),
            use_software_vsync: false,
            vsync_enabled: false,
            debug_vsync_enabled: false,
            keep_running: true,
        }
    }

    /// Record a pulse for `display`, replacing any undispatched one.
    fn record_vsync(&mut self, display: DisplayType, timestamp: Nsecs) {
        let record = &mut self.vsync[display as usize];
        record.timestamp = Some(timestamp);
        record.count = record.count.wrapping_add(1);
    }

    /// Take the next event to deliver and select the connections it goes to.
    ///
    /// Pulses take precedence over other events, and only go to connections
    /// that are due for them. Dead connections are pruned along the way.
    fn collect_pass(&mut self) -> Pass {
        let mut pass: Pass = Default::default();
        let mut vsync_count = 0;

        for (display, record) in BUILTIN_DISPLAYS.iter().zip(self.vsync.iter_mut()) {
            if let Some(timestamp) = record.timestamp.take() {
                vsync_count = record.count;
                pass.event = Some(DisplayEvent::Vsync {
                    display: *display,
                    timestamp,
                    count: record.count,
                });
                pass.had_vsync = true;
                break;
            }
        }

        let mut broadcast = false;
        if !pass.had_vsync {
            pass.event = self.pending_events.pop_front();
            broadcast = pass.event.is_some();
        }

        let had_vsync = pass.had_vsync;
        let mut wants_vsync = false;
        let mut targets = Vec::new();
        self.connections.retain(|id, entry| {
            // Only targets are upgraded: a strong reference taken here could
            // be the last one and must not be dropped under the lock.
            if entry.connection.strong_count() == 0 {
                debug!("Pruning dead connection {}", id);
                return false;
            }

            let mut due = false;
            if entry.mode.wants_vsync() {
                wants_vsync = true;
                if had_vsync {
                    match entry.mode {
                        DeliveryMode::OneShotArmed => {
                            entry.mode = DeliveryMode::Disabled;
                            due = true;
                        }
                        DeliveryMode::Continuous(rate) => due = vsync_count % rate.get() == 0,
                        DeliveryMode::Disabled => (),
                    }
                }
            }

            if due || broadcast {
                match entry.connection.upgrade() {
                    Some(connection) => targets.push(connection),
                    None => {
                        debug!("Pruning dead connection {}", id);
                        return false;
                    }
                }
            }

            true
        });

        pass.targets = targets;
        pass.wants_vsync = wants_vsync;
        pass
    }
}

pub(crate) struct Shared {
    name: String,
    this: Weak<Shared>,
    state: Mutex<DistributorState>,
    cond: Condvar,
    source: Arc<dyn VsyncSource>,
    next_connection_id: AtomicU64,
    software_vsync_period: Duration,
    hardware_vsync_timeout: Duration,
    resync: Option<ResyncCallback>,
}

impl Shared {
    fn check_connection(&self, connection: &EventConnection) -> Result<(), DistributorError> {
        if connection.belongs_to(self) {
            Ok(())
        } else {
            Err(DistributorError::ForeignConnection)
        }
    }

    fn register_connection(&self, connection: &Arc<EventConnection>) -> Result<(), DistributorError> {
        self.check_connection(connection)?;

        let mut state = self.state.lock().unwrap();
        if state.connections.contains_key(&connection.id()) {
            return Err(DistributorError::AlreadyRegistered);
        }
        state.connections.insert(
            connection.id(),
            ConnectionEntry {
                connection: Arc::downgrade(connection),
                mode: DeliveryMode::Disabled,
            },
        );
        debug!("{}: registered connection {}", self.name, connection.id());
        self.cond.notify_all();

        Ok(())
    }

    fn update_mode<F>(&self, connection: &EventConnection, f: F) -> Result<(), DistributorError>
    where
        F: FnOnce(DeliveryMode) -> DeliveryMode,
    {
        self.check_connection(connection)?;

        let mut state = self.state.lock().unwrap();
        let entry = state
            .connections
            .get_mut(&connection.id())
            .ok_or(DistributorError::NotRegistered)?;

        let mode = f(entry.mode);
        if mode != entry.mode {
            trace!(
                "{}: connection {} now {:?}",
                self.name,
                connection.id(),
                mode
            );
            entry.mode = mode;
            self.cond.notify_all();
        }

        Ok(())
    }

    fn request_next_vsync(&self, connection: &EventConnection) -> Result<(), DistributorError> {
        if let Some(resync) = &self.resync {
            resync();
        }

        self.update_mode(connection, |mode| match mode {
            DeliveryMode::Disabled => DeliveryMode::OneShotArmed,
            mode => mode,
        })
    }

    fn set_vsync_rate(&self, rate: u32, connection: &EventConnection) -> Result<(), DistributorError> {
        let mode = NonZeroU32::new(rate).map_or(DeliveryMode::OneShotArmed, DeliveryMode::Continuous);
        self.update_mode(connection, |_| mode)
    }

    fn on_vsync_event(&self, timestamp: Nsecs) {
        let mut state = self.state.lock().unwrap();
        state.record_vsync(DisplayType::Primary, timestamp);
        self.cond.notify_all();
    }

    fn queue_event(&self, event: DisplayEvent) {
        let mut state = self.state.lock().unwrap();
        state.pending_events.push_back(event);
        self.cond.notify_all();
    }

    fn enable_vsync_locked(&self, state: &mut DistributorState) {
        if !state.keep_running {
            return;
        }

        if !state.use_software_vsync && !state.vsync_enabled {
            debug!("{}: enabling vsync source", self.name);
            state.vsync_enabled = true;
            let this = self.this.clone();
            self.source.set_callback(Some(Arc::new(move |timestamp: Nsecs| {
                if let Some(shared) = this.upgrade() {
                    shared.on_vsync_event(timestamp);
                }
            })));
            self.source.set_vsync_enabled(true);
        }
        state.debug_vsync_enabled = true;
    }

    fn disable_vsync_locked(&self, state: &mut DistributorState) {
        if state.vsync_enabled {
            debug!("{}: disabling vsync source", self.name);
            state.vsync_enabled = false;
            self.source.set_vsync_enabled(false);
        }
        state.debug_vsync_enabled = false;
    }

    fn set_software_vsync(&self, software: bool) {
        let mut state = self.state.lock().unwrap();
        if state.use_software_vsync != software {
            debug!(
                "{}: switching to {} vsync",
                self.name,
                if software { "software" } else { "hardware" }
            );
            if software {
                // The hardware does not produce pulses with the screen off.
                self.disable_vsync_locked(&mut state);
            }
            state.use_software_vsync = software;
            self.cond.notify_all();
        }
    }

    /// Wait until there is something to deliver. Returns `None` once the
    /// distributor is shutting down.
    fn wait_for_event_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, DistributorState>,
    ) -> (
        MutexGuard<'a, DistributorState>,
        Option<(DisplayEvent, Vec<Arc<EventConnection>>)>,
    ) {
        loop {
            if !state.keep_running {
                return (state, None);
            }

            let pass = state.collect_pass();

            if pass.had_vsync && !pass.wants_vsync {
                // Nobody is interested in pulses anymore.
                self.disable_vsync_locked(&mut state);
            } else if !pass.had_vsync && pass.wants_vsync {
                self.enable_vsync_locked(&mut state);
            }

            if let Some(event) = pass.event {
                if !pass.targets.is_empty() {
                    return (state, Some((event, pass.targets)));
                }
                // Nobody to deliver to, look for the next event.
                continue;
            }

            if pass.wants_vsync {
                let software = state.use_software_vsync;
                let timeout = if software {
                    self.software_vsync_period
                } else {
                    self.hardware_vsync_timeout
                };

                let (guard, res) = self.cond.wait_timeout(state, timeout).unwrap();
                state = guard;
                if res.timed_out() && state.keep_running {
                    if !software {
                        warn!("{}: timed out waiting for hw vsync, faking it", self.name);
                    }
                    state.record_vsync(DisplayType::Primary, system_time());
                }
            } else {
                state = self.cond.wait(state).unwrap();
            }
        }
    }

    fn thread_main(&self) {
        debug!("{}: distributor thread started", self.name);
        let mut state = self.state.lock().unwrap();
        loop {
            let (guard, dispatch) = self.wait_for_event_locked(state);
            let (event, targets) = match dispatch {
                Some(dispatch) => dispatch,
                None => break,
            };
            drop(guard);

            let mut failed = Vec::new();
            for connection in &targets {
                match connection.post_event(&event) {
                    Ok(()) => trace!("{}: posted {:?} to {}", self.name, event, connection.id()),
                    Err(PostError::WouldBlock) => warn!(
                        "{}: dropping {:?} for connection {}",
                        self.name,
                        event,
                        connection.id()
                    ),
                    Err(e) => {
                        error!(
                            "{}: failed to post to connection {}, removing it: {}",
                            self.name,
                            connection.id(),
                            e
                        );
                        failed.push(connection.id());
                    }
                }
            }
            // Connections may be dropped here, never with the lock held.
            drop(targets);

            state = self.state.lock().unwrap();
            for id in failed {
                state.connections.remove(&id);
            }
        }
        debug!("{}: distributor thread exiting", self.name);
    }
}

/// Fans display events out to a set of connections from a dedicated thread.
pub struct EventDistributor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl EventDistributor {
    pub fn new(source: Arc<dyn VsyncSource>, config: DistributorConfig) -> io::Result<Self> {
        let shared = Arc::new_cyclic(|this| Shared {
            name: config.name,
            this: this.clone(),
            state: Mutex::new(DistributorState::new()),
            cond: Condvar::new(),
            source,
            next_connection_id: AtomicU64::new(1),
            software_vsync_period: config.software_vsync_period,
            hardware_vsync_timeout: config.hardware_vsync_timeout,
            resync: config.resync,
        });

        let thread = thread::Builder::new()
            .name(shared.name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.thread_main()
            })?;

        Ok(EventDistributor {
            shared,
            thread: Some(thread),
        })
    }

    /// Create a connection posting to `transport`. It does not receive vsync
    /// events until it asks for them.
    pub fn create_connection(&self, transport: Box<dyn EventTransport>) -> Arc<EventConnection> {
        let id = ConnectionId(self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(EventConnection::new(
            id,
            transport,
            Arc::downgrade(&self.shared),
        ));

        if let Err(e) = self.shared.register_connection(&connection) {
            error!(
                "{}: failed to register connection {}: {}",
                self.shared.name,
                connection.id(),
                e
            );
        }
        connection
    }

    /// Register a connection that has been removed before.
    pub fn register_connection(
        &self,
        connection: &Arc<EventConnection>,
    ) -> Result<(), DistributorError> {
        self.shared.register_connection(connection)
    }

    /// Stop delivering events to `connection`. Returns whether it was
    /// registered.
    pub fn remove_connection(&self, connection: &EventConnection) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let removed = state.connections.remove(&connection.id()).is_some();
        if removed {
            debug!("{}: removed connection {}", self.shared.name, connection.id());
        }
        removed
    }

    pub fn request_next_vsync(&self, connection: &EventConnection) -> Result<(), DistributorError> {
        self.shared.request_next_vsync(connection)
    }

    pub fn set_vsync_rate(
        &self,
        rate: u32,
        connection: &EventConnection,
    ) -> Result<(), DistributorError> {
        self.shared.set_vsync_rate(rate, connection)
    }

    pub fn delivery_mode(&self, connection: &EventConnection) -> Result<DeliveryMode, DistributorError> {
        self.shared.check_connection(connection)?;
        let state = self.shared.state.lock().unwrap();
        state
            .connections
            .get(&connection.id())
            .map(|entry| entry.mode)
            .ok_or(DistributorError::NotRegistered)
    }

    /// Number of registered connections, including dead ones that have not
    /// been pruned yet.
    pub fn num_connections(&self) -> usize {
        self.shared.state.lock().unwrap().connections.len()
    }

    pub fn is_vsync_enabled(&self) -> bool {
        self.shared.state.lock().unwrap().vsync_enabled
    }

    pub fn is_using_software_vsync(&self) -> bool {
        self.shared.state.lock().unwrap().use_software_vsync
    }

    /// Report a pulse of the primary display. This is the callback installed
    /// into the timing source.
    pub fn on_vsync_event(&self, timestamp: Nsecs) {
        self.shared.on_vsync_event(timestamp);
    }

    /// Broadcast a hotplug event for builtin display `display`.
    pub fn on_hotplug_received(&self, display: u32, connected: bool) {
        let display = match DisplayType::n(display) {
            Some(display) => display,
            None => {
                error!(
                    "{}: ignoring hotplug of invalid display {}",
                    self.shared.name, display
                );
                return;
            }
        };

        self.shared.queue_event(DisplayEvent::Hotplug {
            display,
            timestamp: system_time(),
            connected,
        });
    }

    /// The screen has been turned off: hardware pulses stop, so the
    /// distributor falls back to synthesizing them.
    pub fn on_screen_released(&self) {
        self.shared.queue_event(DisplayEvent::ScreenPower {
            display: DisplayType::Primary,
            timestamp: system_time(),
            on: false,
        });
        self.shared.set_software_vsync(true);
    }

    pub fn on_screen_acquired(&self) {
        self.shared.queue_event(DisplayEvent::ScreenPower {
            display: DisplayType::Primary,
            timestamp: system_time(),
            on: true,
        });
        self.shared.set_software_vsync(false);
    }

    pub fn set_phase_offset(&self, phase: Nsecs) {
        self.shared.source.set_phase_offset(phase);
    }

    pub fn dump(&self) -> String {
        let state = self.shared.state.lock().unwrap();
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = Self::dump_locked(&state, &mut out);
        out
    }

    fn dump_locked(state: &DistributorState, out: &mut String) -> fmt::Result {
        let on_off = |b: bool| if b { "enabled" } else { "disabled" };
        writeln!(out, "VSYNC state: {}", on_off(state.debug_vsync_enabled))?;
        writeln!(out, "  soft-vsync: {}", on_off(state.use_software_vsync))?;
        writeln!(out, "  numListeners={},", state.connections.len())?;
        writeln!(out, "  events-delivered: {}", state.vsync[0].count)?;
        for (id, entry) in &state.connections {
            let alive = if entry.connection.strong_count() > 0 {
                ""
            } else {
                " (dead)"
            };
            writeln!(out, "    {}: count={}{}", id, entry.mode.count(), alive)?;
        }

        Ok(())
    }

    #[cfg(test)]
    fn pulse_pending(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.vsync.iter().any(|r| r.timestamp.is_some())
    }
}

impl Drop for EventDistributor {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.keep_running = false;
            self.shared.cond.notify_all();
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{}: distributor thread panicked", self.shared.name);
            }
        }

        self.shared.source.set_vsync_enabled(false);
        self.shared.source.set_callback(None);
    }
}
