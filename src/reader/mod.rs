//! Cached, batched contract reads

pub mod batch;
pub mod cache;

pub use batch::BatchReader;
pub use cache::ReadCache;
