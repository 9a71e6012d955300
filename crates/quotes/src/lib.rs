//! Quote storage and delivery primitives.
//!
//! A depth tick arriving on an upstream callback thread is normalized into a
//! fixed-layout [`QuoteRecord`], written into the SeqLock [`QuoteCache`], and
//! the instrument id is pushed onto the wake channel so suspended downstream
//! clients can be re-polled. Readers (one per client poll) copy records out
//! under the bounded SeqLock read protocol and serialize full or
//! field-differential JSON objects from them.

pub mod cache;
pub mod hub;
pub mod json;
pub mod record;

pub use cache::QuoteCache;
pub use hub::QuoteHub;
pub use record::{DepthTick, QuoteRecord};
