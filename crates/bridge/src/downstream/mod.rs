pub mod client;
pub mod pool;

pub use client::{ClientState, DownstreamClient};
pub use pool::ClientPool;
