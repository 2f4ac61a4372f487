use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;

use crate::buffer::{BufferItem, GraphicBuffer};
use crate::consumer::backend::BoundImage;
use crate::sync::Fence;

/// Number of slots of a buffer queue.
pub const NUM_BUFFER_SLOTS: usize = 64;

/// Ownership state of a buffer slot, from the consumer's point of view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    /// The consumer does not hold the slot. Its buffer may still be cached.
    #[default]
    Free,
    /// The slot has been acquired but not made current yet.
    Acquired,
    /// The slot holds the buffer being displayed.
    Current,
    /// The slot has been displaced but its release has been deferred.
    PendingRelease,
}

/// Keeps track of how many slots the consumer holds and how many are current,
/// without having to take the consumer's lock.
#[derive(Debug, Default)]
pub struct SlotStats {
    num_held: AtomicUsize,
    num_current: AtomicUsize,
}

impl SlotStats {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of slots in any state but `Free`.
    pub fn num_held(&self) -> usize {
        self.num_held.load(Ordering::Relaxed)
    }

    pub fn num_current(&self) -> usize {
        self.num_current.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct BufferSlot {
    /// Last buffer the source sent for this slot.
    pub buffer: Option<Arc<GraphicBuffer>>,
    /// Fence to pass to the source when releasing the slot. Starts as the
    /// acquire fence, and accumulates the release fences of every reader.
    pub fence: Fence,
    pub frame_number: u64,
    /// Backend image the buffer is bound as, if any.
    pub image: Option<Arc<BoundImage>>,
    state: SlotState,
}

impl BufferSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// The consumer's view of every slot of its source.
pub struct SlotTable {
    slots: Vec<BufferSlot>,
    stats: Arc<SlotStats>,
}

impl SlotTable {
    pub fn new(stats: Arc<SlotStats>) -> Self {
        SlotTable {
            slots: (0..NUM_BUFFER_SLOTS).map(|_| Default::default()).collect(),
            stats,
        }
    }

    pub fn get(&self, slot: usize) -> Option<&BufferSlot> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BufferSlot)> {
        self.slots.iter().enumerate()
    }

    /// Update the state of `slot`. The stats will be updated to reflect the
    /// new state decided by `f`.
    fn update_state<R, F: FnOnce(&mut BufferSlot) -> R>(&mut self, slot: usize, f: F) -> R {
        let entry = &mut self.slots[slot];
        match entry.state {
            SlotState::Free => 0,
            SlotState::Current => {
                self.stats.num_current.fetch_sub(1, Ordering::Relaxed);
                self.stats.num_held.fetch_sub(1, Ordering::Relaxed)
            }
            _ => self.stats.num_held.fetch_sub(1, Ordering::Relaxed),
        };

        // Let the provided closure decide the new state.
        let res = f(entry);

        match entry.state {
            SlotState::Free => 0,
            SlotState::Current => {
                self.stats.num_current.fetch_add(1, Ordering::Relaxed);
                self.stats.num_held.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.stats.num_held.fetch_add(1, Ordering::Relaxed),
        };

        res
    }

    pub fn set_state(&mut self, slot: usize, state: SlotState) {
        self.update_state(slot, |s| s.state = state);
    }

    /// Record the acquisition of `item`. The caller must have checked that
    /// the item's slot is in range.
    pub fn on_acquired(&mut self, item: &BufferItem) {
        self.update_state(item.slot, |s| {
            // A buffer is only sent the first time a slot is acquired after
            // its allocation. Any image bound to the previous one is stale.
            if let Some(buffer) = &item.graphic_buffer {
                s.buffer = Some(Arc::clone(buffer));
                s.image = None;
            }
            s.fence = item.fence.clone();
            s.frame_number = item.frame_number;
            s.state = SlotState::Acquired;
        });
    }

    /// Returns whether `slot` still holds `buffer`.
    pub fn still_tracking(&self, slot: usize, buffer: &Arc<GraphicBuffer>) -> bool {
        self.slots
            .get(slot)
            .and_then(|s| s.buffer.as_ref())
            .map_or(false, |b| Arc::ptr_eq(b, buffer))
    }

    /// Merge `fence` into the release fence of `slot`. Does nothing if the
    /// slot no longer holds `buffer`.
    pub fn add_release_fence(&mut self, slot: usize, buffer: &Arc<GraphicBuffer>, fence: &Fence) {
        if !self.still_tracking(slot, buffer) {
            trace!("Not adding release fence to slot {}: buffer changed", slot);
            return;
        }

        let entry = &mut self.slots[slot];
        entry.fence = if entry.fence.is_valid() {
            entry.fence.merge(fence)
        } else {
            fence.clone()
        };
    }

    /// Mark `slot` as given back to the source, returning its frame number
    /// and accumulated fence. Returns `None` if the slot no longer holds
    /// `buffer`, or has been given back already.
    pub fn take_for_release(
        &mut self,
        slot: usize,
        buffer: &Arc<GraphicBuffer>,
    ) -> Option<(u64, Fence)> {
        if !self.still_tracking(slot, buffer) || self.slots[slot].state == SlotState::Free {
            return None;
        }

        Some(self.update_state(slot, |s| {
            s.state = SlotState::Free;
            (s.frame_number, std::mem::take(&mut s.fence))
        }))
    }

    /// Forget everything about `slot`, returning the image that was bound to
    /// it so the caller can decide whether to keep it alive.
    pub fn free(&mut self, slot: usize) -> Option<Arc<BoundImage>> {
        self.update_state(slot, |s| {
            s.buffer = None;
            s.fence = Fence::no_fence();
            s.frame_number = 0;
            s.state = SlotState::Free;
            s.image.take()
        })
    }

    pub fn set_image(&mut self, slot: usize, image: Arc<BoundImage>) {
        self.slots[slot].image = Some(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Usage;
    use crate::sync::tests::signalable_fence;
    use crate::PixelFormat;

    fn item(slot: usize, frame_number: u64, buffer: Option<&Arc<GraphicBuffer>>) -> BufferItem {
        BufferItem {
            slot,
            graphic_buffer: buffer.cloned(),
            frame_number,
            ..Default::default()
        }
    }

    #[test]
    fn test_slot_state_update() {
        let stats = Arc::new(SlotStats::new());
        let mut table = SlotTable::new(Arc::clone(&stats));
        assert_eq!(stats.num_held(), 0);
        assert_eq!(stats.num_current(), 0);

        let buf0 = GraphicBuffer::new(16, 16, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);
        let buf1 = GraphicBuffer::new(16, 16, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);

        table.on_acquired(&item(0, 1, Some(&buf0)));
        assert_eq!(stats.num_held(), 1);
        assert_eq!(stats.num_current(), 0);

        table.set_state(0, SlotState::Current);
        assert_eq!(stats.num_held(), 1);
        assert_eq!(stats.num_current(), 1);

        table.on_acquired(&item(1, 2, Some(&buf1)));
        table.set_state(0, SlotState::PendingRelease);
        table.set_state(1, SlotState::Current);
        assert_eq!(stats.num_held(), 2);
        assert_eq!(stats.num_current(), 1);

        assert_eq!(table.take_for_release(0, &buf0).map(|(n, _)| n), Some(1));
        assert_eq!(table.get(0).unwrap().state(), SlotState::Free);
        // A free slot cannot be given back twice.
        assert!(table.take_for_release(0, &buf0).is_none());
        assert_eq!(stats.num_held(), 1);
        assert_eq!(stats.num_current(), 1);

        table.free(1);
        assert_eq!(stats.num_held(), 0);
        assert_eq!(stats.num_current(), 0);
        assert!(table.get(1).unwrap().buffer.is_none());
    }

    #[test]
    fn test_reacquire_keeps_cached_buffer() {
        let mut table = SlotTable::new(Arc::new(SlotStats::new()));
        let buf = GraphicBuffer::new(16, 16, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);

        table.on_acquired(&item(3, 1, Some(&buf)));
        table.set_image(3, Arc::new(BoundImage::new(Arc::clone(&buf), 7)));
        assert!(table.take_for_release(3, &buf).is_some());

        // Second acquisition of the same buffer: no buffer is sent.
        table.on_acquired(&item(3, 2, None));
        let slot = table.get(3).unwrap();
        assert!(slot.image.is_some());
        assert!(table.still_tracking(3, &buf));
        assert_eq!(slot.frame_number, 2);

        // A new buffer invalidates the bound image.
        let new_buf = GraphicBuffer::new(32, 32, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);
        table.on_acquired(&item(3, 3, Some(&new_buf)));
        assert!(table.get(3).unwrap().image.is_none());
        assert!(!table.still_tracking(3, &buf));
    }

    #[test]
    fn test_release_fences_accumulate() {
        let mut table = SlotTable::new(Arc::new(SlotStats::new()));
        let buf = GraphicBuffer::new(16, 16, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);
        let other = GraphicBuffer::new(16, 16, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);
        let (a, _signal_a) = signalable_fence();
        let (b, _signal_b) = signalable_fence();

        table.on_acquired(&item(5, 1, Some(&buf)));
        table.add_release_fence(5, &buf, &a);
        assert_eq!(table.get(5).unwrap().fence.num_fds(), 1);
        table.add_release_fence(5, &buf, &b);
        assert_eq!(table.get(5).unwrap().fence.num_fds(), 2);

        // Fences for a buffer the slot does not hold are ignored.
        table.add_release_fence(5, &other, &a.merge(&b));
        assert_eq!(table.get(5).unwrap().fence.num_fds(), 2);
        assert!(table.take_for_release(5, &other).is_none());

        let (_, fence) = table.take_for_release(5, &buf).unwrap();
        assert_eq!(fence.num_fds(), 2);
        assert!(!table.get(5).unwrap().fence.is_valid());
    }
}
