//! Write coalescing workers.
//!
//! Two single-loop batchers sit between the request path and the store:
//! [`strokes`] buffers stroke rows into batched writes (and honors
//! cancellations of still-buffered rows), [`counters`] coalesces per-user
//! counter deltas.  Both drain once on shutdown.

pub mod counters;
pub mod strokes;

pub use counters::{spawn_counter_batcher, CounterUpdate};
pub use strokes::{spawn_stroke_batcher, PendingStroke, StrokeBatcherHandle};
