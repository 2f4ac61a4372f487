//! The consumer side of a buffer queue, as used by a compositor layer.
//!
//! A `BufferLayerConsumer` acquires buffers from a `BufferSource`, keeps the
//! most recent one as its *current* buffer, and computes everything needed to
//! sample it (crop, transform matrix, acquire fence). When a new buffer
//! displaces the current one, the old one is given back to its source along
//! with a fence that signals once every reader is done with it. The release
//! can also be deferred until the caller knows that fence, see
//! `UpdateRequest::defer_release` and `BufferLayerConsumer::release_pending_buffer`.
//!
//! All methods take the consumer's lock for their whole duration, except
//! `do_fence_wait` which releases it before blocking.
pub mod backend;
pub mod slots;
pub mod source;
pub mod transform;

use std::fmt::{self, Write};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace, warn};
use thiserror::Error;

pub use backend::{BoundImage, RenderBackend};
pub use slots::{SlotState, SlotStats, NUM_BUFFER_SLOTS};
pub use source::{AcquireError, BufferSource, SourceError};

use crate::buffer::{
    BufferItem, Dataspace, GraphicBuffer, HdrMetadata, ProducerApi, ScalingMode, Transform, Usage,
};
use crate::sync::{Fence, FenceError, FenceTime};
use crate::{Nsecs, Rect, Region};
use slots::SlotTable;
use transform::Mat4;

/// Usage bits always requested from the source.
const DEFAULT_USAGE_FLAGS: Usage = Usage::HW_COMPOSER;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer has been abandoned")]
    NotInitialized,
    #[error("previous deferred release has not been resolved")]
    ReleasePending,
    #[error("fence synchronization failed: {0}")]
    SyncFailure(#[from] FenceError),
    #[error("rendering backend error: {0:#}")]
    BackendFailure(anyhow::Error),
    #[error("buffer source error: {0}")]
    Source(#[from] SourceError),
}

/// Predicate deciding whether a freshly acquired buffer must be given back
/// instead of being displayed, e.g. because it has the wrong size.
pub trait BufferRejecter: Fn(&Arc<GraphicBuffer>, &BufferItem) -> bool {}
impl<F> BufferRejecter for F where F: Fn(&Arc<GraphicBuffer>, &BufferItem) -> bool {}

/// Receives the notifications of the source this consumer is attached to.
pub trait ContentsChangedListener: Send + Sync {
    fn on_frame_available(&self, item: &BufferItem);
    fn on_sideband_stream_changed(&self);
}

/// Timestamps of a frame, recorded when it is latched.
#[derive(Debug, Clone, Default)]
pub struct FrameEvents {
    pub frame_number: u64,
    pub posted_time: Nsecs,
    pub requested_present_time: Nsecs,
    pub acquire_fence: FenceTime,
    pub latch_time: Option<Nsecs>,
}

/// The layer owning the consumer.
pub trait ConsumerOwner: Send + Sync {
    fn on_disconnect(&self);

    /// Record `new` in the frame history of the layer, and fill `delta` with
    /// the entries that changed since the last call. The history is kept by
    /// the layer.
    fn add_and_get_frame_timestamps(
        &self,
        _new: Option<&FrameEvents>,
        _delta: Option<&mut Vec<FrameEvents>>,
    ) {
    }
}

/// Static parameters of a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    name: String,
    texture_name: u32,
    filtering_enabled: bool,
    default_width: u32,
    default_height: u32,
    usage: Usage,
}

impl ConsumerConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ConsumerConfig {
            name: name.into(),
            texture_name: 0,
            filtering_enabled: true,
            default_width: 1,
            default_height: 1,
            usage: DEFAULT_USAGE_FLAGS,
        }
    }

    /// Backend texture the current buffer is bound to.
    pub fn texture_name(mut self, texture_name: u32) -> Self {
        self.texture_name = texture_name;
        self
    }

    pub fn filtering_enabled(mut self, enabled: bool) -> Self {
        self.filtering_enabled = enabled;
        self
    }

    pub fn default_size(mut self, width: u32, height: u32) -> Self {
        self.default_width = width;
        self.default_height = height;
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Parameters of a call to `BufferLayerConsumer::update_current_buffer`.
#[derive(Default, Clone, Copy)]
pub struct UpdateRequest<'a> {
    /// Checked against every acquired buffer before it becomes current.
    pub rejecter: Option<&'a dyn BufferRejecter>,
    /// Buffers due after this time are left in the source. 0 means now.
    pub expected_present_time: Nsecs,
    /// Highest frame number that may be acquired. 0 means no limit.
    pub max_frame_number: u64,
    /// Signals once the outgoing buffer is not read anymore.
    pub release_fence: Option<&'a Fence>,
    /// Keep the outgoing buffer until `release_pending_buffer` is called
    /// instead of releasing it right away.
    pub defer_release: bool,
}

impl<'a> UpdateRequest<'a> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn rejecter(mut self, rejecter: &'a dyn BufferRejecter) -> Self {
        self.rejecter = Some(rejecter);
        self
    }

    pub fn expected_present_time(mut self, time: Nsecs) -> Self {
        self.expected_present_time = time;
        self
    }

    pub fn max_frame_number(mut self, frame_number: u64) -> Self {
        self.max_frame_number = frame_number;
        self
    }

    pub fn release_fence(mut self, fence: &'a Fence) -> Self {
        self.release_fence = Some(fence);
        self
    }

    pub fn defer_release(mut self, defer: bool) -> Self {
        self.defer_release = defer;
        self
    }
}

impl<'a> fmt::Debug for UpdateRequest<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRequest")
            .field("rejecter", &self.rejecter.is_some())
            .field("expected_present_time", &self.expected_present_time)
            .field("max_frame_number", &self.max_frame_number)
            .field("release_fence", &self.release_fence)
            .field("defer_release", &self.defer_release)
            .finish()
    }
}

/// Properties of an acquired item the caller may act upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquiredInfo {
    pub auto_refresh: bool,
    pub queued_buffer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new buffer is now current.
    Updated(AcquiredInfo),
    /// The acquired buffer has been declined by the rejecter and given back.
    Rejected(AcquiredInfo),
    /// The source had nothing new.
    NoBufferAvailable,
    /// The next buffer is not due yet; retry closer to its present time.
    PresentLater,
}

/// Snapshot of everything known about the current buffer.
#[derive(Debug, Clone)]
pub struct CurrentFrame {
    pub slot: Option<usize>,
    pub buffer: Option<Arc<GraphicBuffer>>,
    /// Signals once the producer is done writing `buffer`.
    pub fence: Fence,
    /// `fence`, along with the time it was seen signaled.
    pub fence_time: FenceTime,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub timestamp: Nsecs,
    pub data_space: Dataspace,
    pub hdr_metadata: HdrMetadata,
    pub frame_number: u64,
    pub transform_to_display_inverse: bool,
    pub surface_damage: Region,
    pub api: ProducerApi,
    /// Texture-coordinate matrix, column-major.
    pub transform_matrix: Mat4,
    /// Whether the renderer may reuse what it cached for `buffer`.
    pub stale_for_gpu: bool,
}

impl Default for CurrentFrame {
    fn default() -> Self {
        CurrentFrame {
            slot: None,
            buffer: None,
            fence: Fence::no_fence(),
            fence_time: Default::default(),
            crop: Rect::EMPTY,
            transform: Transform::empty(),
            scaling_mode: ScalingMode::Freeze,
            timestamp: 0,
            data_space: Dataspace::UNKNOWN,
            hdr_metadata: Default::default(),
            frame_number: 0,
            transform_to_display_inverse: false,
            surface_damage: Region::new(),
            api: ProducerApi::None,
            transform_matrix: transform::IDENTITY,
            stale_for_gpu: false,
        }
    }
}

/// A displaced buffer whose release is waiting for `release_pending_buffer`.
struct PendingRelease {
    slot: usize,
    buffer: Arc<GraphicBuffer>,
}

struct ConsumerState {
    source: Box<dyn BufferSource>,
    slots: SlotTable,
    current: CurrentFrame,
    pending_release: Option<PendingRelease>,
    /// Image of the current buffer after its slot has been freed, kept alive
    /// until the backend says it is done with it.
    freed_image: Option<Arc<BoundImage>>,
    prev_final_release_fence: Fence,
    default_width: u32,
    default_height: u32,
    filtering_enabled: bool,
    abandoned: bool,
    listener: Option<Weak<dyn ContentsChangedListener>>,
    owner: Option<Weak<dyn ConsumerOwner>>,
}

impl ConsumerState {
    /// Give `slot` back to the source along with its accumulated fence. Does
    /// nothing if the slot does not hold `buffer` anymore.
    fn release_buffer_locked(
        &mut self,
        slot: usize,
        buffer: &Arc<GraphicBuffer>,
    ) -> Result<(), SourceError> {
        let (frame_number, fence) = match self.slots.take_for_release(slot, buffer) {
            Some(release) => release,
            None => return Ok(()),
        };

        let res = self
            .source
            .release_buffer(slot, frame_number, fence.clone());
        if let Err(SourceError::StaleBufferSlot(_)) = res {
            self.free_buffer_locked(slot);
        }
        self.prev_final_release_fence = fence;

        res
    }

    /// Forget the buffer of `slot`. If it is the current one, the consumer
    /// disowns it and keeps its image until `release_freed_image`.
    fn free_buffer_locked(&mut self, slot: usize) {
        let image = self.slots.free(slot);
        if self.current.slot == Some(slot) {
            self.current.slot = None;
            self.current.buffer = None;
            self.freed_image = image;
        }
    }

    fn compute_transform_matrix_locked(&mut self) {
        if self.current.buffer.is_none() {
            debug!("Computing transform matrix without a current buffer");
        }

        self.current.transform_matrix = transform::compute_transform_matrix(
            self.current.buffer.as_deref(),
            &self.current.crop,
            self.current.transform,
            self.filtering_enabled,
        );
    }
}

/// Consumer of a buffer queue, keeping track of the buffer a layer currently
/// displays.
pub struct BufferLayerConsumer {
    name: String,
    texture_name: u32,
    backend: Arc<dyn RenderBackend>,
    stats: Arc<SlotStats>,
    state: Mutex<ConsumerState>,
}

impl BufferLayerConsumer {
    pub fn new(
        mut source: Box<dyn BufferSource>,
        backend: Arc<dyn RenderBackend>,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        source.set_consumer_usage_bits(config.usage | DEFAULT_USAGE_FLAGS)?;
        source.set_default_buffer_size(config.default_width, config.default_height)?;

        debug!(
            "[{}] Created consumer for texture {}",
            config.name, config.texture_name
        );

        let stats = Arc::new(SlotStats::new());
        Ok(BufferLayerConsumer {
            texture_name: config.texture_name,
            backend,
            state: Mutex::new(ConsumerState {
                source,
                slots: SlotTable::new(Arc::clone(&stats)),
                current: Default::default(),
                pending_release: None,
                freed_image: None,
                prev_final_release_fence: Fence::no_fence(),
                default_width: config.default_width,
                default_height: config.default_height,
                filtering_enabled: config.filtering_enabled,
                abandoned: false,
                listener: None,
                owner: None,
            }),
            stats,
            name: config.name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot counters, readable without taking the consumer's lock.
    pub fn slot_stats(&self) -> &Arc<SlotStats> {
        &self.stats
    }

    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            error!("[{}] set_default_buffer_size: consumer is abandoned", self.name);
            return Err(ConsumerError::NotInitialized);
        }

        state.default_width = width;
        state.default_height = height;
        state.source.set_default_buffer_size(width, height)?;

        Ok(())
    }

    /// Request `usage` from the producer, in addition to the bits every
    /// compositor buffer needs.
    pub fn set_consumer_usage_bits(&self, usage: Usage) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            error!("[{}] set_consumer_usage_bits: consumer is abandoned", self.name);
            return Err(ConsumerError::NotInitialized);
        }

        state
            .source
            .set_consumer_usage_bits(usage | DEFAULT_USAGE_FLAGS)?;

        Ok(())
    }

    /// Acquire the next buffer from the source and make it current.
    ///
    /// The previously current buffer is released, or kept as pending release
    /// if `request.defer_release` is set. On success the new buffer is bound
    /// right away if the backend relies on implicit synchronization,
    /// otherwise the renderer must call `bind_current_buffer` before
    /// sampling it.
    pub fn update_current_buffer(
        &self,
        request: UpdateRequest,
    ) -> Result<UpdateOutcome, ConsumerError> {
        trace!("[{}] update_current_buffer: {:?}", self.name, request);
        let mut state = self.state.lock().unwrap();

        if state.abandoned {
            error!("[{}] update_current_buffer: consumer is abandoned", self.name);
            return Err(ConsumerError::NotInitialized);
        }

        if request.defer_release && state.pending_release.is_some() {
            error!(
                "[{}] update_current_buffer: deferred release still pending",
                self.name
            );
            return Err(ConsumerError::ReleasePending);
        }

        let item = match state
            .source
            .acquire_buffer(request.expected_present_time, request.max_frame_number)
        {
            Ok(item) => item,
            Err(AcquireError::NoBufferAvailable) => return Ok(UpdateOutcome::NoBufferAvailable),
            Err(AcquireError::PresentLater) => return Ok(UpdateOutcome::PresentLater),
            Err(AcquireError::Source(e)) => {
                error!("[{}] update_current_buffer: acquire failed: {}", self.name, e);
                return Err(e.into());
            }
        };

        let slot = item.slot;
        if slot >= NUM_BUFFER_SLOTS {
            error!("[{}] Source returned invalid slot {}", self.name, slot);
            return Err(SourceError::InvalidSlot(slot).into());
        }
        state.slots.on_acquired(&item);

        let info = AcquiredInfo {
            auto_refresh: item.auto_refresh,
            queued_buffer: item.queued_buffer,
        };

        let buffer = match state.slots.get(slot).and_then(|s| s.buffer.clone()) {
            Some(buffer) => buffer,
            None => {
                error!("[{}] Acquired slot {} has no buffer", self.name, slot);
                state.slots.set_state(slot, SlotState::Free);
                if let Err(e) = state
                    .source
                    .release_buffer(slot, item.frame_number, item.fence.clone())
                {
                    error!("[{}] Failed to release slot {}: {}", self.name, slot, e);
                }
                return Err(SourceError::InvalidSlot(slot).into());
            }
        };

        if let Some(rejecter) = request.rejecter {
            if rejecter(&buffer, &item) {
                debug!(
                    "[{}] Rejected buffer {} in slot {}",
                    self.name,
                    buffer.id(),
                    slot
                );
                if state.current.slot == Some(slot) {
                    // The current buffer acquired again: it stays on screen.
                    state.slots.set_state(slot, SlotState::Current);
                } else if let Err(e) = state.release_buffer_locked(slot, &buffer) {
                    error!("[{}] Failed to release rejected buffer: {}", self.name, e);
                }
                return Ok(UpdateOutcome::Rejected(info));
            }
        }

        self.update_and_release_locked(&mut state, &item, buffer, &request)?;

        if self.backend.uses_implicit_sync() {
            self.bind_current_buffer_locked(&mut state)?;
        }

        Ok(UpdateOutcome::Updated(info))
    }

    fn update_and_release_locked(
        &self,
        state: &mut ConsumerState,
        item: &BufferItem,
        buffer: Arc<GraphicBuffer>,
        request: &UpdateRequest,
    ) -> Result<(), ConsumerError> {
        let slot = item.slot;

        if state.current.slot != Some(slot) {
            if let Err(e) = self.sync_for_release_locked(state, request.release_fence) {
                // The old buffer cannot be released safely, so drop the new
                // frame instead.
                if let Err(e) = state.release_buffer_locked(slot, &buffer) {
                    error!("[{}] Failed to release slot {}: {}", self.name, slot, e);
                }
                return Err(e);
            }
        }

        trace!(
            "[{}] update_and_release: (slot={:?}) -> (slot={} buffer={})",
            self.name,
            state.current.slot,
            slot,
            buffer.id()
        );

        match (state.current.slot, state.current.buffer.clone()) {
            // Same buffer acquired again, e.g. in shared buffer mode.
            (Some(cur_slot), Some(_)) if cur_slot == slot => (),
            (Some(cur_slot), Some(cur_buffer)) => {
                if request.defer_release {
                    state.slots.set_state(cur_slot, SlotState::PendingRelease);
                    state.pending_release = Some(PendingRelease {
                        slot: cur_slot,
                        buffer: cur_buffer,
                    });
                } else if let Err(e) = state.release_buffer_locked(cur_slot, &cur_buffer) {
                    // The new frame is still usable, keep going.
                    error!(
                        "[{}] update_and_release: failed to release buffer: {}",
                        self.name, e
                    );
                }
            }
            _ => (),
        }

        state.slots.set_state(slot, SlotState::Current);
        state.freed_image = None;
        let current = &mut state.current;
        current.slot = Some(slot);
        current.buffer = Some(buffer);
        current.stale_for_gpu = false;
        current.crop = item.crop;
        current.transform = item.transform;
        current.scaling_mode = item.scaling_mode;
        current.timestamp = item.timestamp;
        current.data_space = item.data_space;
        current.hdr_metadata = item.hdr_metadata.clone();
        current.fence = item.fence.clone();
        current.fence_time = FenceTime::new(item.fence.clone());
        current.frame_number = item.frame_number;
        current.transform_to_display_inverse = item.transform_to_display_inverse;
        current.surface_damage = item.surface_damage.clone();
        current.api = item.api;

        state.compute_transform_matrix_locked();
        debug_assert!(self.stats.num_current() <= 1);

        Ok(())
    }

    /// Attach the caller's release fence to the outgoing buffer, if the
    /// backend relies on explicit fences.
    fn sync_for_release_locked(
        &self,
        state: &mut ConsumerState,
        release_fence: Option<&Fence>,
    ) -> Result<(), ConsumerError> {
        if self.backend.uses_implicit_sync() {
            return Ok(());
        }

        let (slot, buffer) = match (state.current.slot, &state.current.buffer) {
            (Some(slot), Some(buffer)) => (slot, Arc::clone(buffer)),
            _ => return Ok(()),
        };

        match release_fence {
            None => Ok(()),
            Some(fence) if !fence.is_valid() => {
                error!("[{}] sync_for_release: invalid release fence", self.name);
                Err(ConsumerError::SyncFailure(FenceError::Invalid))
            }
            Some(fence) => {
                state.slots.add_release_fence(slot, &buffer, fence);
                Ok(())
            }
        }
    }

    /// Bind the current buffer to the consumer's texture.
    pub fn bind_current_buffer(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            error!("[{}] bind_current_buffer: consumer is abandoned", self.name);
            return Err(ConsumerError::NotInitialized);
        }

        self.bind_current_buffer_locked(&mut state)
    }

    fn bind_current_buffer_locked(&self, state: &mut ConsumerState) -> Result<(), ConsumerError> {
        self.backend
            .bind_external_buffer(
                self.texture_name,
                state.current.buffer.as_ref(),
                &state.current.fence,
            )
            .map_err(|e| {
                error!("[{}] Failed to bind current buffer: {:#}", self.name, e);
                ConsumerError::BackendFailure(e)
            })?;

        if let (Some(slot), Some(buffer)) = (state.current.slot, &state.current.buffer) {
            let already_bound = state
                .slots
                .get(slot)
                .and_then(|s| s.image.as_ref())
                .map_or(false, |image| Arc::ptr_eq(image.buffer(), buffer));
            if !already_bound {
                let image = Arc::new(BoundImage::new(Arc::clone(buffer), self.texture_name));
                state.slots.set_image(slot, image);
            }
        }

        Ok(())
    }

    /// Signal that reads of the outstanding buffer complete once `fence`
    /// signals. The outstanding buffer is the pending release if there is
    /// one, the current buffer otherwise.
    pub fn set_release_fence(&self, fence: &Fence) {
        if !fence.is_valid() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let (slot, buffer) = match (&state.pending_release, state.current.slot, &state.current.buffer)
        {
            (Some(pending), _, _) => (pending.slot, Arc::clone(&pending.buffer)),
            (None, Some(slot), Some(buffer)) => (slot, Arc::clone(buffer)),
            _ => return,
        };

        state.slots.add_release_fence(slot, &buffer, fence);
    }

    /// Release the buffer displaced by the last deferred update. Returns
    /// whether there was one.
    pub fn release_pending_buffer(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let pending = match state.pending_release.take() {
            Some(pending) => pending,
            None => {
                trace!("[{}] Pending buffer already released", self.name);
                return false;
            }
        };

        debug!(
            "[{}] Releasing pending buffer in slot {}",
            self.name, pending.slot
        );
        if let Err(e) = state.release_buffer_locked(pending.slot, &pending.buffer) {
            error!("[{}] release_pending_buffer failed: {}", self.name, e);
        }

        true
    }

    /// Fence of the last buffer given back to the source.
    pub fn prev_final_release_fence(&self) -> Fence {
        self.state.lock().unwrap().prev_final_release_fence.clone()
    }

    /// Block until the producer is done writing the current buffer.
    pub fn do_fence_wait(&self) -> Result<(), ConsumerError> {
        let fence = self.state.lock().unwrap().current.fence.clone();
        if !fence.is_valid() {
            return Ok(());
        }

        if self.backend.uses_wait_sync() {
            if !self.backend.wait_fence(&fence) {
                error!("[{}] do_fence_wait: backend failed to wait on fence", self.name);
                return Err(FenceError::BackendWait.into());
            }
        } else if let Err(e) = fence.wait_forever() {
            error!("[{}] do_fence_wait: error waiting for fence: {}", self.name, e);
            return Err(e.into());
        }

        Ok(())
    }

    pub fn set_filtering_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            error!("[{}] set_filtering_enabled: consumer is abandoned", self.name);
            return;
        }

        let needs_recompute = state.filtering_enabled != enabled;
        state.filtering_enabled = enabled;

        if needs_recompute {
            if state.current.buffer.is_some() {
                state.compute_transform_matrix_locked();
            } else {
                debug!("[{}] set_filtering_enabled without a current buffer", self.name);
            }
        }
    }

    /// Returns whether the renderer may use what it cached for the current
    /// buffer, and marks it as cached.
    pub fn get_and_set_current_buffer_cache_hint(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::replace(&mut state.current.stale_for_gpu, true)
    }

    /// Called when the source reclaims `slot`.
    pub fn on_slot_freed(&self, slot: usize) {
        if slot >= NUM_BUFFER_SLOTS {
            warn!("[{}] Ignoring free of invalid slot {}", self.name, slot);
            return;
        }

        trace!("[{}] Freeing slot {}", self.name, slot);
        self.state.lock().unwrap().free_buffer_locked(slot);
    }

    /// Image of the current buffer whose slot has been freed, if it is still
    /// alive.
    pub fn freed_image(&self) -> Option<Arc<BoundImage>> {
        self.state.lock().unwrap().freed_image.clone()
    }

    /// Drop the image retained by `on_slot_freed`, once the backend is done
    /// with it. Returns whether there was one.
    pub fn release_freed_image(&self) -> bool {
        self.state.lock().unwrap().freed_image.take().is_some()
    }

    /// Detach the consumer from its source for good. Every buffer is
    /// dropped, and every further mutating call fails with `NotInitialized`.
    pub fn abandon(&self) {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            return;
        }

        debug!("[{}] Abandoning consumer", self.name);
        for slot in 0..NUM_BUFFER_SLOTS {
            state.free_buffer_locked(slot);
        }
        state.current.buffer = None;
        state.current.slot = None;
        state.pending_release = None;

        if let Err(e) = state.source.disconnect() {
            error!("[{}] Failed to disconnect from source: {}", self.name, e);
        }
        state.abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.lock().unwrap().abandoned
    }

    pub fn set_contents_changed_listener(&self, listener: Weak<dyn ContentsChangedListener>) {
        self.state.lock().unwrap().listener = Some(listener);
    }

    pub fn set_owner(&self, owner: Weak<dyn ConsumerOwner>) {
        self.state.lock().unwrap().owner = Some(owner);
    }

    fn listener(&self) -> Option<Arc<dyn ContentsChangedListener>> {
        self.state
            .lock()
            .unwrap()
            .listener
            .as_ref()
            .and_then(|l| l.upgrade())
    }

    /// Forward a frame-available notification from the source to the
    /// listener. The listener is called without the consumer's lock held.
    pub fn on_frame_available(&self, item: &BufferItem) {
        if let Some(listener) = self.listener() {
            listener.on_frame_available(item);
        }
    }

    pub fn on_sideband_stream_changed(&self) {
        if let Some(listener) = self.listener() {
            listener.on_sideband_stream_changed();
        }
    }

    fn owner(&self) -> Option<Arc<dyn ConsumerOwner>> {
        self.state
            .lock()
            .unwrap()
            .owner
            .as_ref()
            .and_then(|o| o.upgrade())
    }

    /// Forward a producer disconnection to the owning layer.
    pub fn on_disconnect(&self) {
        if let Some(owner) = self.owner() {
            owner.on_disconnect();
        }
    }

    /// Forward frame timestamps from the producer to the owning layer, and
    /// collect its updates in `delta`. Nothing happens once the owner is gone.
    pub fn add_and_get_frame_timestamps(
        &self,
        new: Option<&FrameEvents>,
        delta: Option<&mut Vec<FrameEvents>>,
    ) {
        if let Some(owner) = self.owner() {
            owner.add_and_get_frame_timestamps(new, delta);
        }
    }

    pub fn current_frame(&self) -> CurrentFrame {
        self.state.lock().unwrap().current.clone()
    }

    pub fn current_buffer(&self) -> Option<Arc<GraphicBuffer>> {
        self.state.lock().unwrap().current.buffer.clone()
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.state.lock().unwrap().current.slot
    }

    pub fn current_fence(&self) -> Fence {
        self.state.lock().unwrap().current.fence.clone()
    }

    pub fn current_fence_time(&self) -> FenceTime {
        self.state.lock().unwrap().current.fence_time.clone()
    }

    /// Crop of the current buffer. In scale-crop mode the crop is shrunk to
    /// the aspect ratio of the default buffer size.
    pub fn current_crop(&self) -> Rect {
        let state = self.state.lock().unwrap();
        match state.current.scaling_mode {
            ScalingMode::ScaleCrop => transform::scale_down_crop(
                &state.current.crop,
                state.default_width,
                state.default_height,
            ),
            _ => state.current.crop,
        }
    }

    pub fn current_transform(&self) -> Transform {
        self.state.lock().unwrap().current.transform
    }

    pub fn current_scaling_mode(&self) -> ScalingMode {
        self.state.lock().unwrap().current.scaling_mode
    }

    pub fn timestamp(&self) -> Nsecs {
        self.state.lock().unwrap().current.timestamp
    }

    pub fn current_data_space(&self) -> Dataspace {
        self.state.lock().unwrap().current.data_space
    }

    pub fn current_hdr_metadata(&self) -> HdrMetadata {
        self.state.lock().unwrap().current.hdr_metadata.clone()
    }

    pub fn frame_number(&self) -> u64 {
        self.state.lock().unwrap().current.frame_number
    }

    pub fn current_api(&self) -> ProducerApi {
        self.state.lock().unwrap().current.api
    }

    pub fn surface_damage(&self) -> Region {
        self.state.lock().unwrap().current.surface_damage.clone()
    }

    pub fn transform_matrix(&self) -> Mat4 {
        self.state.lock().unwrap().current.transform_matrix
    }

    pub fn transform_to_display_inverse(&self) -> bool {
        self.state.lock().unwrap().current.transform_to_display_inverse
    }

    /// Human-readable state of the consumer, each line starting with `prefix`.
    pub fn dump(&self, prefix: &str) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.dump_locked(&state, prefix, &mut out);
        out
    }

    fn dump_locked(&self, state: &ConsumerState, prefix: &str, out: &mut String) -> fmt::Result {
        let current = &state.current;
        writeln!(
            out,
            "{}texture={} current_slot={:?} frame={}",
            prefix, self.texture_name, current.slot, current.frame_number
        )?;
        writeln!(
            out,
            "{}crop={} transform={:#x} scaling={:?}",
            prefix,
            current.crop,
            current.transform.bits(),
            current.scaling_mode
        )?;
        writeln!(
            out,
            "{}pending_release={:?} abandoned={}",
            prefix,
            state.pending_release.as_ref().map(|p| p.slot),
            state.abandoned
        )?;

        for (index, slot) in state.slots.iter() {
            let buffer = match &slot.buffer {
                Some(buffer) => buffer,
                None => continue,
            };
            writeln!(
                out,
                "{}  [{:02}] {:?} frame={} buffer={} {}x{} {} fence={:?}",
                prefix,
                index,
                slot.state(),
                slot.frame_number,
                buffer.id(),
                buffer.width,
                buffer.height,
                buffer.format,
                slot.fence
            )?;
        }

        Ok(())
    }
}

impl Drop for BufferLayerConsumer {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::os::unix::net::UnixStream;

    use crate::sync::tests::signalable_fence;
    use crate::sync::SignalTime;
    use crate::PixelFormat;

    #[derive(Default)]
    struct SourceLog {
        queue: VecDeque<Result<BufferItem, AcquireError>>,
        releases: Vec<(usize, u64, Fence)>,
        default_size: (u32, u32),
        usage: Usage,
        disconnected: bool,
        fail_releases: bool,
    }

    /// A source returning scripted acquisition results.
    #[derive(Clone, Default)]
    struct ScriptedSource(Arc<Mutex<SourceLog>>);

    impl ScriptedSource {
        fn push(&self, item: BufferItem) {
            self.0.lock().unwrap().queue.push_back(Ok(item));
        }

        fn push_err(&self, err: AcquireError) {
            self.0.lock().unwrap().queue.push_back(Err(err));
        }

        fn released_slots(&self) -> Vec<usize> {
            self.0.lock().unwrap().releases.iter().map(|r| r.0).collect()
        }

        fn last_release(&self) -> (usize, u64, Fence) {
            self.0.lock().unwrap().releases.last().cloned().unwrap()
        }
    }

    impl BufferSource for ScriptedSource {
        fn acquire_buffer(&mut self, _: Nsecs, _: u64) -> Result<BufferItem, AcquireError> {
            self.0
                .lock()
                .unwrap()
                .queue
                .pop_front()
                .unwrap_or(Err(AcquireError::NoBufferAvailable))
        }

        fn release_buffer(
            &mut self,
            slot: usize,
            frame_number: u64,
            fence: Fence,
        ) -> Result<(), SourceError> {
            let mut log = self.0.lock().unwrap();
            log.releases.push((slot, frame_number, fence));
            if log.fail_releases {
                Err(SourceError::Abandoned)
            } else {
                Ok(())
            }
        }

        fn set_default_buffer_size(&mut self, width: u32, height: u32) -> Result<(), SourceError> {
            self.0.lock().unwrap().default_size = (width, height);
            Ok(())
        }

        fn set_consumer_usage_bits(&mut self, usage: Usage) -> Result<(), SourceError> {
            self.0.lock().unwrap().usage = usage;
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), SourceError> {
            self.0.lock().unwrap().disconnected = true;
            Ok(())
        }
    }

    /// A backend recording the buffers it is asked to bind.
    #[derive(Default)]
    struct RecordingBackend {
        implicit_sync: bool,
        wait_sync: bool,
        fail_binds: bool,
        binds: Mutex<Vec<Option<u64>>>,
        waits: Mutex<usize>,
    }

    impl RecordingBackend {
        fn explicit() -> Arc<Self> {
            Arc::new(Default::default())
        }

        fn implicit() -> Arc<Self> {
            Arc::new(RecordingBackend {
                implicit_sync: true,
                ..Default::default()
            })
        }

        fn bound_ids(&self) -> Vec<Option<u64>> {
            self.binds.lock().unwrap().clone()
        }
    }

    impl RenderBackend for RecordingBackend {
        fn bind_external_buffer(
            &self,
            _texture: u32,
            buffer: Option<&Arc<GraphicBuffer>>,
            _fence: &Fence,
        ) -> anyhow::Result<()> {
            if self.fail_binds {
                anyhow::bail!("no more texture units");
            }
            self.binds.lock().unwrap().push(buffer.map(|b| b.id()));
            Ok(())
        }

        fn uses_implicit_sync(&self) -> bool {
            self.implicit_sync
        }

        fn uses_wait_sync(&self) -> bool {
            self.wait_sync
        }

        fn wait_fence(&self, _fence: &Fence) -> bool {
            *self.waits.lock().unwrap() += 1;
            true
        }
    }

    fn new_buffer() -> Arc<GraphicBuffer> {
        GraphicBuffer::new(64, 64, PixelFormat::RGBA_8888, Usage::HW_TEXTURE)
    }

    fn item(slot: usize, frame_number: u64, buffer: &Arc<GraphicBuffer>) -> BufferItem {
        BufferItem {
            slot,
            graphic_buffer: Some(Arc::clone(buffer)),
            frame_number,
            crop: Rect::new(0, 0, 64, 64),
            queued_buffer: true,
            ..Default::default()
        }
    }

    fn new_consumer(backend: Arc<RecordingBackend>) -> (BufferLayerConsumer, ScriptedSource) {
        let source = ScriptedSource::default();
        let consumer = BufferLayerConsumer::new(
            Box::new(source.clone()),
            backend,
            ConsumerConfig::new("test").texture_name(3),
        )
        .unwrap();
        (consumer, source)
    }

    fn update(consumer: &BufferLayerConsumer) -> Result<UpdateOutcome, ConsumerError> {
        consumer.update_current_buffer(UpdateRequest::new())
    }

    const UPDATED: UpdateOutcome = UpdateOutcome::Updated(AcquiredInfo {
        auto_refresh: false,
        queued_buffer: true,
    });

    #[test]
    fn test_construction_configures_source() {
        let source = ScriptedSource::default();
        let _consumer = BufferLayerConsumer::new(
            Box::new(source.clone()),
            RecordingBackend::explicit(),
            ConsumerConfig::new("test")
                .default_size(320, 240)
                .usage(Usage::HW_TEXTURE),
        )
        .unwrap();

        let log = source.0.lock().unwrap();
        assert_eq!(log.default_size, (320, 240));
        assert_eq!(log.usage, Usage::HW_TEXTURE | Usage::HW_COMPOSER);
    }

    #[test]
    fn test_empty_source() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());

        assert_eq!(update(&consumer).unwrap(), UpdateOutcome::NoBufferAvailable);
        let frame = consumer.current_frame();
        assert_eq!(frame.slot, None);
        assert!(frame.buffer.is_none());
        assert_eq!(frame.frame_number, 0);
        assert_eq!(frame.transform_matrix, transform::IDENTITY);

        source.push_err(AcquireError::PresentLater);
        assert_eq!(update(&consumer).unwrap(), UpdateOutcome::PresentLater);
        assert_eq!(consumer.current_slot(), None);

        source.push_err(AcquireError::Source(SourceError::Abandoned));
        assert!(matches!(
            update(&consumer),
            Err(ConsumerError::Source(SourceError::Abandoned))
        ));
    }

    #[test]
    fn test_explicit_sync_release_with_fence() {
        let backend = RecordingBackend::explicit();
        let (consumer, source) = new_consumer(Arc::clone(&backend));
        let buf0 = new_buffer();
        let buf2 = new_buffer();

        source.push(item(0, 1, &buf0));
        assert_eq!(update(&consumer).unwrap(), UPDATED);
        assert_eq!(consumer.current_slot(), Some(0));

        let (release_fence, signal) = signalable_fence();
        source.push(item(2, 2, &buf2));
        let outcome = consumer
            .update_current_buffer(UpdateRequest::new().release_fence(&release_fence))
            .unwrap();
        assert_eq!(outcome, UPDATED);

        assert_eq!(consumer.current_slot(), Some(2));
        assert_eq!(consumer.frame_number(), 2);
        assert!(Arc::ptr_eq(&consumer.current_buffer().unwrap(), &buf2));

        let (slot, frame_number, fence) = source.last_release();
        assert_eq!((slot, frame_number), (0, 1));
        assert_eq!(fence.num_fds(), 1);
        assert!(!fence.is_signaled().unwrap());
        drop(signal);
        assert!(fence.is_signaled().unwrap());
        assert_eq!(consumer.prev_final_release_fence().num_fds(), 1);

        // Binding is left to the renderer.
        assert!(backend.bound_ids().is_empty());
        consumer.bind_current_buffer().unwrap();
        assert_eq!(backend.bound_ids(), vec![Some(buf2.id())]);
    }

    #[test]
    fn test_implicit_sync_binds_on_update() {
        let backend = RecordingBackend::implicit();
        let (consumer, source) = new_consumer(Arc::clone(&backend));
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();
        assert_eq!(backend.bound_ids(), vec![Some(buf0.id())]);

        // Release fences are not needed and thus not attached.
        let (release_fence, _signal) = signalable_fence();
        source.push(item(1, 2, &buf1));
        consumer
            .update_current_buffer(UpdateRequest::new().release_fence(&release_fence))
            .unwrap();
        assert_eq!(backend.bound_ids(), vec![Some(buf0.id()), Some(buf1.id())]);
        let (slot, _, fence) = source.last_release();
        assert_eq!(slot, 0);
        assert!(!fence.is_valid());
    }

    #[test]
    fn test_bind_failure() {
        let backend = Arc::new(RecordingBackend {
            implicit_sync: true,
            fail_binds: true,
            ..Default::default()
        });
        let (consumer, source) = new_consumer(backend);
        let buf = new_buffer();

        source.push(item(0, 1, &buf));
        assert!(matches!(
            update(&consumer),
            Err(ConsumerError::BackendFailure(_))
        ));
        // Bookkeeping is not affected.
        assert_eq!(consumer.current_slot(), Some(0));
        assert!(matches!(
            consumer.bind_current_buffer(),
            Err(ConsumerError::BackendFailure(_))
        ));
    }

    #[test]
    fn test_rejected_buffer() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let odd = GraphicBuffer::new(17, 17, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();

        let wrong_size = |buffer: &Arc<GraphicBuffer>, _: &BufferItem| buffer.width != 64;
        source.push(item(3, 2, &odd));
        let outcome = consumer
            .update_current_buffer(UpdateRequest::new().rejecter(&wrong_size))
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Rejected(_)));

        assert_eq!(source.released_slots(), vec![3]);
        assert_eq!(consumer.current_slot(), Some(0));
        assert_eq!(consumer.frame_number(), 1);
        assert_eq!(consumer.slot_stats().num_held(), 1);
    }

    #[test]
    fn test_rejected_current_buffer_stays_current() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();

        // The current slot comes back, without its buffer as it is cached.
        source.push(BufferItem {
            graphic_buffer: None,
            ..item(0, 2, &buf0)
        });
        let reject_all = |_: &Arc<GraphicBuffer>, _: &BufferItem| true;
        let outcome = consumer
            .update_current_buffer(UpdateRequest::new().rejecter(&reject_all))
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Rejected(_)));

        assert!(source.released_slots().is_empty());
        assert_eq!(consumer.current_slot(), Some(0));
        assert!(Arc::ptr_eq(&consumer.current_buffer().unwrap(), &buf0));
        assert_eq!(consumer.slot_stats().num_current(), 1);
        assert_eq!(consumer.slot_stats().num_held(), 1);

        // The next frame releases slot 0 exactly once.
        source.push(item(1, 3, &buf1));
        assert_eq!(update(&consumer).unwrap(), UPDATED);
        assert_eq!(source.released_slots(), vec![0]);
        assert_eq!(consumer.slot_stats().num_current(), 1);
        assert_eq!(consumer.slot_stats().num_held(), 1);
    }

    #[test]
    fn test_invalid_release_fence_keeps_old_frame() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();

        let invalid = Fence::no_fence();
        source.push(item(1, 2, &buf1));
        let res = consumer.update_current_buffer(UpdateRequest::new().release_fence(&invalid));
        assert!(matches!(
            res,
            Err(ConsumerError::SyncFailure(FenceError::Invalid))
        ));

        // The new frame has been given back, the old one is still current.
        assert_eq!(source.released_slots(), vec![1]);
        assert_eq!(consumer.current_slot(), Some(0));
        assert_eq!(consumer.frame_number(), 1);
        assert_eq!(consumer.slot_stats().num_current(), 1);
    }

    #[test]
    fn test_deferred_release() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buffers: Vec<_> = (0..3).map(|_| new_buffer()).collect();

        source.push(item(0, 1, &buffers[0]));
        update(&consumer).unwrap();
        assert!(!consumer.release_pending_buffer());

        source.push(item(1, 2, &buffers[1]));
        let deferred = UpdateRequest::new().defer_release(true);
        assert_eq!(consumer.update_current_buffer(deferred).unwrap(), UPDATED);
        assert!(source.released_slots().is_empty());
        assert!(consumer.dump("").contains("pending_release=Some(0)"));

        // A second deferral cannot happen before the first is resolved, and
        // nothing gets acquired.
        source.push(item(2, 3, &buffers[2]));
        assert!(matches!(
            consumer.update_current_buffer(deferred),
            Err(ConsumerError::ReleasePending)
        ));
        assert_eq!(consumer.current_slot(), Some(1));
        assert_eq!(source.0.lock().unwrap().queue.len(), 1);

        // The release fence goes to the pending buffer.
        let (release_fence, _signal) = signalable_fence();
        consumer.set_release_fence(&release_fence);
        assert!(consumer.release_pending_buffer());
        let (slot, frame_number, fence) = source.last_release();
        assert_eq!((slot, frame_number), (0, 1));
        assert_eq!(fence.num_fds(), 1);
        assert!(!consumer.release_pending_buffer());

        assert_eq!(consumer.update_current_buffer(deferred).unwrap(), UPDATED);
        assert_eq!(consumer.current_slot(), Some(2));
    }

    #[test]
    fn test_release_fence_on_current_buffer() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        // Nothing outstanding: no-op.
        let (fence_a, _signal_a) = signalable_fence();
        consumer.set_release_fence(&fence_a);

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();
        consumer.set_release_fence(&fence_a);
        consumer.set_release_fence(&Fence::no_fence());

        source.push(item(1, 2, &buf1));
        update(&consumer).unwrap();
        let (slot, _, fence) = source.last_release();
        assert_eq!(slot, 0);
        assert_eq!(fence.num_fds(), 1);
    }

    #[test]
    fn test_release_failure_does_not_fail_update() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();

        source.0.lock().unwrap().fail_releases = true;
        source.push(item(1, 2, &buf1));
        assert_eq!(update(&consumer).unwrap(), UPDATED);
        assert_eq!(consumer.current_slot(), Some(1));
        assert_eq!(source.released_slots(), vec![0]);
    }

    #[test]
    fn test_frame_numbers_increase() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buffers: Vec<_> = (0..4).map(|_| new_buffer()).collect();

        let mut last = consumer.frame_number();
        for frame in 1..=12u64 {
            let slot = (frame % 4) as usize;
            let mut next = item(slot, frame, &buffers[slot]);
            // Buffers are only sent on the first acquisition of their slot.
            if frame > 4 {
                next.graphic_buffer = None;
            }
            source.push(next);
            update(&consumer).unwrap();

            let current = consumer.current_frame();
            assert!(current.frame_number > last);
            last = current.frame_number;
            assert_eq!(current.slot, Some(slot));
            assert!(Arc::ptr_eq(current.buffer.as_ref().unwrap(), &buffers[slot]));
            assert_eq!(consumer.slot_stats().num_current(), 1);
            assert_eq!(consumer.slot_stats().num_held(), 1);
        }
    }

    #[test]
    fn test_freed_current_slot_retains_image() {
        let backend = RecordingBackend::explicit();
        let (consumer, source) = new_consumer(Arc::clone(&backend));
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();
        consumer.bind_current_buffer().unwrap();

        consumer.on_slot_freed(0);
        assert_eq!(consumer.current_slot(), None);
        assert!(consumer.current_buffer().is_none());
        let image = consumer.freed_image().unwrap();
        assert!(Arc::ptr_eq(image.buffer(), &buf0));
        assert_eq!(image.texture(), 3);
        assert_eq!(consumer.slot_stats().num_current(), 0);

        assert!(consumer.release_freed_image());
        assert!(!consumer.release_freed_image());

        // Freeing a slot that is not current leaves the current frame alone.
        source.push(item(1, 2, &buf1));
        update(&consumer).unwrap();
        consumer.on_slot_freed(0);
        consumer.on_slot_freed(NUM_BUFFER_SLOTS);
        assert_eq!(consumer.current_slot(), Some(1));
        assert!(consumer.freed_image().is_none());
    }

    #[test]
    fn test_abandon() {
        let backend = RecordingBackend::explicit();
        let (consumer, source) = new_consumer(Arc::clone(&backend));
        let buf = new_buffer();

        source.push(item(0, 1, &buf));
        update(&consumer).unwrap();
        consumer.abandon();

        assert!(consumer.is_abandoned());
        assert!(source.0.lock().unwrap().disconnected);
        assert!(consumer.current_buffer().is_none());
        assert_eq!(consumer.slot_stats().num_held(), 0);
        assert!(matches!(
            update(&consumer),
            Err(ConsumerError::NotInitialized)
        ));
        assert!(matches!(
            consumer.set_default_buffer_size(10, 10),
            Err(ConsumerError::NotInitialized)
        ));
        assert!(matches!(
            consumer.set_consumer_usage_bits(Usage::HW_TEXTURE),
            Err(ConsumerError::NotInitialized)
        ));
        assert!(matches!(
            consumer.bind_current_buffer(),
            Err(ConsumerError::NotInitialized)
        ));
        assert!(backend.bound_ids().is_empty());
    }

    #[test]
    fn test_frame_attributes() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        consumer.set_default_buffer_size(100, 100).unwrap();
        let buf = GraphicBuffer::new(200, 100, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);

        let mut damage = Region::new();
        damage.add(Rect::new(0, 0, 10, 10));
        source.push(BufferItem {
            crop: Rect::new(0, 0, 200, 100),
            scaling_mode: ScalingMode::ScaleCrop,
            transform: Transform::ROT_90,
            timestamp: 1234,
            data_space: Dataspace::DISPLAY_P3,
            api: ProducerApi::Egl,
            transform_to_display_inverse: true,
            surface_damage: damage.clone(),
            ..item(0, 1, &buf)
        });
        update(&consumer).unwrap();

        assert_eq!(consumer.current_crop(), Rect::new(50, 0, 150, 100));
        assert_eq!(consumer.current_frame().crop, Rect::new(0, 0, 200, 100));
        assert_eq!(consumer.current_scaling_mode(), ScalingMode::ScaleCrop);
        assert_eq!(consumer.current_transform(), Transform::ROT_90);
        assert_eq!(consumer.timestamp(), 1234);
        assert_eq!(consumer.current_data_space(), Dataspace::DISPLAY_P3);
        assert_eq!(consumer.current_api(), ProducerApi::Egl);
        assert_eq!(consumer.surface_damage(), damage);
        assert!(consumer.transform_to_display_inverse());
        assert_eq!(consumer.current_hdr_metadata(), HdrMetadata::default());
        assert_eq!(
            consumer.transform_matrix(),
            transform::compute_transform_matrix(
                Some(&*buf),
                &Rect::new(0, 0, 200, 100),
                Transform::ROT_90,
                true
            )
        );
    }

    #[test]
    fn test_filtering_recomputes_matrix() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf = new_buffer();

        // No current buffer: nothing to recompute.
        consumer.set_filtering_enabled(false);
        assert_eq!(consumer.transform_matrix(), transform::IDENTITY);

        source.push(BufferItem {
            crop: Rect::new(0, 0, 32, 32),
            ..item(0, 1, &buf)
        });
        update(&consumer).unwrap();
        let unfiltered = consumer.transform_matrix();
        assert!((unfiltered[0] - 0.5).abs() < 1e-6);

        consumer.set_filtering_enabled(true);
        let filtered = consumer.transform_matrix();
        assert!((filtered[0] - 31.0 / 64.0).abs() < 1e-6);
    }

    #[test]
    fn test_cache_hint() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let buf1 = new_buffer();

        source.push(item(0, 1, &buf0));
        update(&consumer).unwrap();
        assert!(!consumer.get_and_set_current_buffer_cache_hint());
        assert!(consumer.get_and_set_current_buffer_cache_hint());

        source.push(item(1, 2, &buf1));
        update(&consumer).unwrap();
        assert!(!consumer.get_and_set_current_buffer_cache_hint());
    }

    #[test]
    fn test_fence_wait() {
        let backend = RecordingBackend::explicit();
        let (consumer, source) = new_consumer(Arc::clone(&backend));
        let buf0 = new_buffer();

        // No fence: returns right away.
        consumer.do_fence_wait().unwrap();

        let (fence_end, signal_end) = UnixStream::pair().unwrap();
        source.push(BufferItem {
            fence: Fence::new(fence_end.into()),
            ..item(0, 1, &buf0)
        });
        update(&consumer).unwrap();

        let signaler = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(signal_end);
        });
        consumer.do_fence_wait().unwrap();
        assert!(consumer.current_fence().is_signaled().unwrap());
        signaler.join().unwrap();
        assert_eq!(*backend.waits.lock().unwrap(), 0);
    }

    #[test]
    fn test_current_fence_time() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf0 = new_buffer();
        let buf1 = new_buffer();
        assert_eq!(
            consumer.current_fence_time().signal_time().unwrap(),
            SignalTime::Invalid
        );

        let (fence, signal) = signalable_fence();
        source.push(BufferItem {
            fence,
            ..item(0, 1, &buf0)
        });
        update(&consumer).unwrap();
        let fence_time = consumer.current_fence_time();
        assert_eq!(fence_time.signal_time().unwrap(), SignalTime::Pending);

        drop(signal);
        let time = match fence_time.signal_time().unwrap() {
            SignalTime::Signaled(time) => time,
            other => panic!("fence not signaled: {:?}", other),
        };
        // Later copies share the first observation.
        assert_eq!(
            consumer.current_fence_time().signal_time().unwrap(),
            SignalTime::Signaled(time)
        );

        // A new frame comes with a new fence time.
        source.push(item(1, 2, &buf1));
        update(&consumer).unwrap();
        assert_eq!(
            consumer.current_fence_time().signal_time().unwrap(),
            SignalTime::Invalid
        );
    }

    #[test]
    fn test_fence_wait_in_backend() {
        let backend = Arc::new(RecordingBackend {
            wait_sync: true,
            ..Default::default()
        });
        let (consumer, source) = new_consumer(Arc::clone(&backend));
        let buf0 = new_buffer();
        let (fence, _signal) = signalable_fence();

        source.push(BufferItem {
            fence,
            ..item(0, 1, &buf0)
        });
        update(&consumer).unwrap();
        consumer.do_fence_wait().unwrap();
        assert_eq!(*backend.waits.lock().unwrap(), 1);
    }

    #[derive(Default)]
    struct Listener {
        frames: Mutex<Vec<u64>>,
        sideband: Mutex<usize>,
        disconnects: Mutex<usize>,
        history: Mutex<Vec<FrameEvents>>,
    }

    impl ContentsChangedListener for Listener {
        fn on_frame_available(&self, item: &BufferItem) {
            self.frames.lock().unwrap().push(item.frame_number);
        }

        fn on_sideband_stream_changed(&self) {
            *self.sideband.lock().unwrap() += 1;
        }
    }

    impl ConsumerOwner for Listener {
        fn on_disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }

        fn add_and_get_frame_timestamps(
            &self,
            new: Option<&FrameEvents>,
            delta: Option<&mut Vec<FrameEvents>>,
        ) {
            let mut history = self.history.lock().unwrap();
            if let Some(new) = new {
                history.push(new.clone());
            }
            if let Some(delta) = delta {
                delta.extend(history.drain(..));
            }
        }
    }

    #[test]
    fn test_listeners_are_weak() {
        let (consumer, _source) = new_consumer(RecordingBackend::explicit());
        let listener = Arc::new(Listener::default());
        let weak_listener: Weak<dyn ContentsChangedListener> = Arc::downgrade(&listener) as _;
        let weak_owner: Weak<dyn ConsumerOwner> = Arc::downgrade(&listener) as _;
        consumer.set_contents_changed_listener(weak_listener);
        consumer.set_owner(weak_owner);

        consumer.on_frame_available(&BufferItem {
            frame_number: 7,
            ..Default::default()
        });
        consumer.on_sideband_stream_changed();
        consumer.on_disconnect();
        assert_eq!(*listener.frames.lock().unwrap(), vec![7]);
        assert_eq!(*listener.sideband.lock().unwrap(), 1);
        assert_eq!(*listener.disconnects.lock().unwrap(), 1);

        let events = FrameEvents {
            frame_number: 7,
            posted_time: 100,
            ..Default::default()
        };
        consumer.add_and_get_frame_timestamps(Some(&events), None);
        let mut delta = Vec::new();
        consumer.add_and_get_frame_timestamps(None, Some(&mut delta));
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].frame_number, 7);
        assert_eq!(delta[0].posted_time, 100);

        // Once the listener is gone, notifications are dropped.
        drop(listener);
        consumer.on_frame_available(&Default::default());
        consumer.on_sideband_stream_changed();
        consumer.on_disconnect();
        let mut delta = Vec::new();
        consumer.add_and_get_frame_timestamps(Some(&events), Some(&mut delta));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_dump() {
        let (consumer, source) = new_consumer(RecordingBackend::explicit());
        let buf = new_buffer();
        source.push(item(4, 1, &buf));
        update(&consumer).unwrap();

        let dump = consumer.dump("  ");
        assert!(dump.contains("texture=3 current_slot=Some(4) frame=1"));
        assert!(dump.contains("crop=[0,0,64,64]"));
        assert!(dump.contains("[04] Current frame=1"));
        assert!(dump.lines().all(|l| l.starts_with("  ")));
    }
}
