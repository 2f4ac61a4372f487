//! Interface to the queue the consumer acquires its buffers from.
use thiserror::Error;

use crate::buffer::{BufferItem, Usage};
use crate::sync::Fence;
use crate::Nsecs;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("buffer source has been abandoned")]
    Abandoned,
    #[error("invalid slot {0}")]
    InvalidSlot(usize),
    #[error("slot {0} has been reallocated since it was acquired")]
    StaleBufferSlot(usize),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AcquireError {
    /// No buffer is queued. This is the normal "nothing new" condition.
    #[error("no buffer available")]
    NoBufferAvailable,
    /// A buffer is queued, but is due after the requested present time.
    #[error("buffer should be presented later")]
    PresentLater,
    #[error("buffer source error: {0}")]
    Source(#[from] SourceError),
}

/// The producer-facing buffer queue, seen from the consumer side.
///
/// Implementors track which slots the consumer currently holds. Every buffer
/// returned by `acquire_buffer` is eventually given back through
/// `release_buffer`, along with a fence that signals once the consumer is
/// done reading it.
///
/// When the source reclaims a slot for reallocation, whoever drives it must
/// report it through `BufferLayerConsumer::on_slot_freed`, and the next
/// acquisition of that slot must carry the new buffer.
pub trait BufferSource: Send {
    /// Acquire the oldest queued buffer, unless its desired presentation time
    /// is after `present_when` (if non-zero) or its frame number exceeds
    /// `max_frame_number` (if non-zero).
    fn acquire_buffer(
        &mut self,
        present_when: Nsecs,
        max_frame_number: u64,
    ) -> Result<BufferItem, AcquireError>;

    /// Give `slot` back to the producer. `fence` signals once the consumer
    /// has stopped accessing the buffer.
    fn release_buffer(
        &mut self,
        slot: usize,
        frame_number: u64,
        fence: Fence,
    ) -> Result<(), SourceError>;

    fn set_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), SourceError>;

    fn set_consumer_usage_bits(&mut self, usage: Usage) -> Result<(), SourceError>;

    /// Disconnect the consumer from the source. Buffers still held by the
    /// consumer are implicitly released.
    fn disconnect(&mut self) -> Result<(), SourceError>;
}
