mod memory_blobs;
mod memory_store;

pub use memory_blobs::*;
pub use memory_store::*;
