#![forbid(unsafe_code)]

// Media module - mediasoup worker pool, engine configuration and wire types

pub mod config;
pub mod retry;
pub mod types;
pub mod worker_pool;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use types::{ConsumerInfo, MediaError, MediaResult, TransportInfo};
pub use worker_pool::{WorkerLease, WorkerPool};
