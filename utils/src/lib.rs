//! Helpers for exercising `flingr` without a real compositor: an in-memory
//! buffer queue and a fence timeline signaled from software.
pub mod fake_queue;
pub mod fence_timeline;
