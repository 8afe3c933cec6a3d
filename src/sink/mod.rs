//! Outbound side of the pipeline: bounded push queue and transport session

pub mod push;
pub mod transport;

pub use push::PushSink;
pub use transport::{AudioStreamParams, TcpPushSession, TransportSession, VideoStreamParams};
