//! Interface to the renderer that samples the consumer's current buffer.
use std::fmt;
use std::sync::Arc;

use log::trace;

use crate::buffer::GraphicBuffer;
use crate::sync::Fence;

/// The rendering backend, e.g. a GL or Vulkan context.
pub trait RenderBackend: Send + Sync {
    /// Bind `buffer` as the content of the external texture `texture`. `fence`
    /// must have signaled before the backend samples from it. A `None`
    /// buffer unbinds the texture.
    fn bind_external_buffer(
        &self,
        texture: u32,
        buffer: Option<&Arc<GraphicBuffer>>,
        fence: &Fence,
    ) -> anyhow::Result<()>;

    /// Whether binding a buffer synchronizes with prior accesses by itself.
    ///
    /// Backends that return `false` rely on explicit release fences, and
    /// bind at draw time through `BufferLayerConsumer::bind_current_buffer`.
    fn uses_implicit_sync(&self) -> bool;

    /// Whether the backend can make its command stream wait on a fence
    /// without blocking the calling thread.
    fn uses_wait_sync(&self) -> bool;

    /// Queue a wait on `fence` into the backend's command stream. Returns
    /// `false` if the wait could not be queued.
    fn wait_fence(&self, fence: &Fence) -> bool;
}

/// A buffer that has been bound to a backend texture.
///
/// The consumer keeps one per slot, so re-binding a buffer that is already
/// bound does not require re-importing it.
pub struct BoundImage {
    buffer: Arc<GraphicBuffer>,
    texture: u32,
}

impl BoundImage {
    pub(crate) fn new(buffer: Arc<GraphicBuffer>, texture: u32) -> Self {
        BoundImage { buffer, texture }
    }

    pub fn buffer(&self) -> &Arc<GraphicBuffer> {
        &self.buffer
    }

    pub fn texture(&self) -> u32 {
        self.texture
    }
}

impl fmt::Debug for BoundImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundImage")
            .field("buffer", &self.buffer.id())
            .field("texture", &self.texture)
            .finish()
    }
}

impl Drop for BoundImage {
    fn drop(&mut self) {
        trace!(
            "Dropping image of buffer {} bound to texture {}",
            self.buffer.id(),
            self.texture
        );
    }
}
