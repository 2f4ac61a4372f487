use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use super::{DisplayEvent, DistributorError, Shared};

/// Identifies a connection within its distributor. Identifiers are never
/// reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(super) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum PostError {
    /// The receiving end is full. The event is dropped but the connection
    /// is kept.
    #[error("transport would block")]
    WouldBlock,
    /// The receiving end is gone.
    #[error("transport is closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Carries events to the client at the other end of a connection.
///
/// `post` is called from the distributor's thread without its lock held, so
/// it may block, although it should not for long.
pub trait EventTransport: Send + Sync {
    fn post(&self, event: &DisplayEvent) -> Result<(), PostError>;
}

impl<F> EventTransport for F
where
    F: Fn(&DisplayEvent) -> Result<(), PostError> + Send + Sync,
{
    fn post(&self, event: &DisplayEvent) -> Result<(), PostError> {
        self(event)
    }
}

/// In-process transport over a bounded channel. Posting to a full channel
/// fails with `WouldBlock`, like a non-blocking socket would.
pub struct ChannelTransport {
    sender: Mutex<SyncSender<DisplayEvent>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, Receiver<DisplayEvent>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (
            ChannelTransport {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl EventTransport for ChannelTransport {
    fn post(&self, event: &DisplayEvent) -> Result<(), PostError> {
        match self.sender.lock().unwrap().try_send(*event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PostError::WouldBlock),
            Err(TrySendError::Disconnected(_)) => Err(PostError::Closed),
        }
    }
}

/// A subscriber to the events of an `EventDistributor`.
///
/// The distributor only keeps a weak reference to its connections: once the
/// last `Arc` is dropped, the connection is forgotten on the next
/// distribution pass.
pub struct EventConnection {
    id: ConnectionId,
    transport: Box<dyn EventTransport>,
    distributor: Weak<Shared>,
}

impl EventConnection {
    pub(super) fn new(
        id: ConnectionId,
        transport: Box<dyn EventTransport>,
        distributor: Weak<Shared>,
    ) -> Self {
        EventConnection {
            id,
            transport,
            distributor,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(super) fn belongs_to(&self, distributor: &Shared) -> bool {
        std::ptr::eq(self.distributor.as_ptr(), distributor)
    }

    pub(super) fn post_event(&self, event: &DisplayEvent) -> Result<(), PostError> {
        self.transport.post(event)
    }

    fn distributor(&self) -> Result<Arc<Shared>, DistributorError> {
        self.distributor.upgrade().ok_or(DistributorError::Stopped)
    }

    /// Ask for the next vsync event, once.
    pub fn request_next_vsync(&self) -> Result<(), DistributorError> {
        self.distributor()?.request_next_vsync(self)
    }

    /// Receive every `rate`-th vsync event. A rate of 0 asks for the next
    /// event only.
    pub fn set_vsync_rate(&self, rate: u32) -> Result<(), DistributorError> {
        self.distributor()?.set_vsync_rate(rate, self)
    }
}

impl fmt::Debug for EventConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConnection")
            .field("id", &self.id)
            .finish()
    }
}
