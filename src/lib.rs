#![forbid(unsafe_code)]

// interview-sfu library - signaling and session orchestration over mediasoup

pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
