pub mod block_hash;
pub mod error;
pub mod ids;
pub mod volume;
