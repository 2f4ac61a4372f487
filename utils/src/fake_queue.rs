//! An in-memory buffer queue with both of its ends.
//!
//! The producer side dequeues buffers, fills them (or pretends to) and queues
//! them back. The consumer side implements `BufferSource` and can be handed
//! to a `BufferLayerConsumer`. Both sides share the same state, so tests can
//! check what the consumer gave back to the producer.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use flingr::buffer::{BufferItem, GraphicBuffer, Usage};
use flingr::consumer::{AcquireError, BufferSource, SourceError};
use flingr::sync::Fence;
use flingr::{Nsecs, PixelFormat};
use log::{debug, trace};
use thiserror::Error;

/// Buffers due more than this far after the requested present time are
/// acquired anyway, as their timestamp is probably bogus.
const MAX_REASONABLE_NSEC: Nsecs = 1_000_000_000;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no free slot")]
    NoFreeSlot,
    #[error("invalid slot {0}")]
    InvalidSlot(usize),
    #[error("slot {0} is not dequeued")]
    NotDequeued(usize),
    #[error("queue has been abandoned")]
    Abandoned,
}

/// State of a slot, from the queue's point of view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueSlotState {
    #[default]
    Free,
    Dequeued,
    Queued,
    Acquired,
}

#[derive(Default)]
struct QueueSlot {
    buffer: Option<Arc<GraphicBuffer>>,
    state: QueueSlotState,
    /// The consumer has been sent the current buffer of the slot already.
    sent_to_consumer: bool,
    /// Fence the consumer released the slot with.
    release_fence: Fence,
    frame_number: u64,
}

struct QueueState {
    slots: Vec<QueueSlot>,
    queue: VecDeque<BufferItem>,
    default_width: u32,
    default_height: u32,
    consumer_usage: Usage,
    next_frame_number: u64,
    abandoned: bool,
}

/// A buffer the producer can write into.
#[derive(Debug)]
pub struct DequeuedBuffer {
    pub slot: usize,
    pub buffer: Arc<GraphicBuffer>,
    /// Signals once the consumer has stopped reading the buffer.
    pub fence: Fence,
    /// The slot's previous buffer has been replaced. The consumer must be
    /// told with `BufferLayerConsumer::on_slot_freed`.
    pub reallocated: bool,
}

/// Producer end of the queue.
#[derive(Clone)]
pub struct FakeBufferQueue {
    state: Arc<Mutex<QueueState>>,
}

impl FakeBufferQueue {
    pub fn new(num_slots: usize) -> Self {
        FakeBufferQueue {
            state: Arc::new(Mutex::new(QueueState {
                slots: (0..num_slots).map(|_| Default::default()).collect(),
                queue: VecDeque::new(),
                default_width: 1,
                default_height: 1,
                consumer_usage: Usage::empty(),
                next_frame_number: 1,
                abandoned: false,
            })),
        }
    }

    /// Returns the consumer end of the queue.
    pub fn consumer(&self) -> Box<dyn BufferSource> {
        Box::new(FakeQueueConsumer {
            state: Arc::clone(&self.state),
        })
    }

    /// Get a free slot holding a buffer of the requested size and format.
    /// A size of 0 means the default size set by the consumer.
    pub fn dequeue_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<DequeuedBuffer, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            return Err(QueueError::Abandoned);
        }

        let (width, height) = if width == 0 || height == 0 {
            (state.default_width, state.default_height)
        } else {
            (width, height)
        };
        let usage = state.consumer_usage;
        let matches = |b: &Arc<GraphicBuffer>| {
            b.width == width && b.height == height && b.format == format && b.usage.contains(usage)
        };

        // Prefer a free slot whose buffer can be reused as-is.
        let free = |s: &QueueSlot| s.state == QueueSlotState::Free;
        let slot = state
            .slots
            .iter()
            .position(|s| free(s) && s.buffer.as_ref().map_or(false, matches))
            .or_else(|| state.slots.iter().position(|s| free(s) && s.buffer.is_none()))
            .or_else(|| state.slots.iter().position(free))
            .ok_or(QueueError::NoFreeSlot)?;

        let entry = &mut state.slots[slot];
        let reallocated = match &entry.buffer {
            Some(buffer) if matches(buffer) => false,
            previous => {
                let reallocated = previous.is_some();
                entry.buffer = Some(GraphicBuffer::new(width, height, format, usage));
                entry.sent_to_consumer = false;
                reallocated
            }
        };
        entry.state = QueueSlotState::Dequeued;
        let fence = std::mem::take(&mut entry.release_fence);
        let buffer = match &entry.buffer {
            Some(buffer) => Arc::clone(buffer),
            None => return Err(QueueError::InvalidSlot(slot)),
        };

        trace!("Dequeued slot {} (reallocated: {})", slot, reallocated);
        Ok(DequeuedBuffer {
            slot,
            buffer,
            fence,
            reallocated,
        })
    }

    /// Queue `slot` for display. Everything but the slot, buffer and frame
    /// number is taken from `item`. Returns the frame number of the queued
    /// buffer.
    pub fn queue_buffer(&self, slot: usize, item: BufferItem) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            return Err(QueueError::Abandoned);
        }

        let frame_number = state.next_frame_number;
        let entry = state
            .slots
            .get_mut(slot)
            .ok_or(QueueError::InvalidSlot(slot))?;
        if entry.state != QueueSlotState::Dequeued {
            return Err(QueueError::NotDequeued(slot));
        }
        entry.state = QueueSlotState::Queued;
        entry.frame_number = frame_number;

        state.next_frame_number += 1;
        state.queue.push_back(BufferItem {
            slot,
            graphic_buffer: None,
            frame_number,
            queued_buffer: true,
            ..item
        });

        Ok(frame_number)
    }

    /// Give a dequeued slot back without queuing it.
    pub fn cancel_buffer(&self, slot: usize, fence: Fence) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .slots
            .get_mut(slot)
            .ok_or(QueueError::InvalidSlot(slot))?;
        if entry.state != QueueSlotState::Dequeued {
            return Err(QueueError::NotDequeued(slot));
        }
        entry.state = QueueSlotState::Free;
        entry.release_fence = fence;

        Ok(())
    }

    /// Drop the buffers of all free slots, returning the slots that had one.
    /// The consumer must be told about each of them.
    pub fn free_unused_buffers(&self) -> Vec<usize> {
        let mut state = self.state.lock().unwrap();
        state
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(_, s)| s.state == QueueSlotState::Free && s.buffer.is_some())
            .map(|(slot, s)| {
                s.buffer = None;
                s.sent_to_consumer = false;
                s.release_fence = Fence::no_fence();
                slot
            })
            .collect()
    }

    pub fn slot_state(&self, slot: usize) -> Option<QueueSlotState> {
        self.state.lock().unwrap().slots.get(slot).map(|s| s.state)
    }

    /// Fence the consumer released `slot` with, if the slot is free.
    pub fn release_fence(&self, slot: usize) -> Option<Fence> {
        let state = self.state.lock().unwrap();
        state
            .slots
            .get(slot)
            .filter(|s| s.state == QueueSlotState::Free)
            .map(|s| s.release_fence.clone())
    }

    pub fn num_queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn default_size(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.default_width, state.default_height)
    }

    pub fn consumer_usage(&self) -> Usage {
        self.state.lock().unwrap().consumer_usage
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.lock().unwrap().abandoned
    }
}

/// Consumer end of a `FakeBufferQueue`.
pub struct FakeQueueConsumer {
    state: Arc<Mutex<QueueState>>,
}

impl QueueState {
    /// Whether the item at the front of the queue can be skipped in favor of
    /// the next one, for a consumer presenting at `present_when`.
    fn front_is_droppable(&self, present_when: Nsecs) -> bool {
        match self.queue.get(1) {
            Some(next) => next.timestamp <= present_when,
            None => false,
        }
    }
}

impl BufferSource for FakeQueueConsumer {
    fn acquire_buffer(
        &mut self,
        present_when: Nsecs,
        max_frame_number: u64,
    ) -> Result<BufferItem, AcquireError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            return Err(SourceError::Abandoned.into());
        }

        if present_when != 0 {
            while state.front_is_droppable(present_when) {
                if max_frame_number != 0
                    && state.queue[1].frame_number > max_frame_number
                {
                    break;
                }
                if let Some(dropped) = state.queue.pop_front() {
                    debug!("Dropping frame {}", dropped.frame_number);
                    state.slots[dropped.slot].state = QueueSlotState::Free;
                }
            }
        }

        let front = state.queue.front().ok_or(AcquireError::NoBufferAvailable)?;
        if max_frame_number != 0 && front.frame_number > max_frame_number {
            return Err(AcquireError::NoBufferAvailable);
        }
        if present_when != 0
            && front.timestamp > present_when
            && front.timestamp - present_when < MAX_REASONABLE_NSEC
        {
            return Err(AcquireError::PresentLater);
        }

        let mut item = state
            .queue
            .pop_front()
            .ok_or(AcquireError::NoBufferAvailable)?;
        let slot = &mut state.slots[item.slot];
        slot.state = QueueSlotState::Acquired;
        if !slot.sent_to_consumer {
            item.graphic_buffer = slot.buffer.clone();
            slot.sent_to_consumer = true;
        }

        trace!("Acquired frame {} from slot {}", item.frame_number, item.slot);
        Ok(item)
    }

    fn release_buffer(
        &mut self,
        slot: usize,
        frame_number: u64,
        fence: Fence,
    ) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .slots
            .get_mut(slot)
            .ok_or(SourceError::InvalidSlot(slot))?;

        if entry.state != QueueSlotState::Acquired || entry.frame_number != frame_number {
            return Err(SourceError::StaleBufferSlot(slot));
        }

        trace!("Released frame {} of slot {}", frame_number, slot);
        entry.state = QueueSlotState::Free;
        entry.release_fence = fence;

        Ok(())
    }

    fn set_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.default_width = width;
        state.default_height = height;
        Ok(())
    }

    fn set_consumer_usage_bits(&mut self, usage: Usage) -> Result<(), SourceError> {
        self.state.lock().unwrap().consumer_usage = usage;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            return Err(SourceError::Abandoned);
        }

        debug!("Consumer disconnected");
        state.abandoned = true;
        state.queue.clear();
        for slot in state.slots.iter_mut() {
            slot.state = QueueSlotState::Free;
        }

        Ok(())
    }
}
