//! Concurrent primitives
//!
//! Foundation pieces used by the qdisc implementations:
//! - [`TokenBitmap`]: a 56-bit atomic bitmap whose clear operation is guarded
//!   by an 8-bit modification token
//! - [`GroupLock`]: a two-group generalization of a reader/writer lock where
//!   members of one group run concurrently and opposing groups exclude each
//!   other

pub mod bitmap;
pub mod group_lock;

pub use bitmap::{BitmapView, TokenBitmap, BITMAP_WIDTH};
pub use group_lock::{Group, GroupGuard, GroupLock};
