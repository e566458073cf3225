//! On-disk shard representation and its two read cursors.

pub mod adjacency;
pub mod edata;
pub mod memory;
pub mod sliding;

pub use memory::MemoryShard;
pub use sliding::SlidingShard;
