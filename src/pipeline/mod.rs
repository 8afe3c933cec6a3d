//! Push pipeline
//!
//! The pipeline bridges capture callbacks into encoder sessions and the
//! push sink, with a shared clock keeping audio and video timestamps
//! mutually consistent:
//!
//! - Capturers deliver raw frames on their own threads
//! - Frame handlers stamp, encode and forward packets synchronously
//! - The push sink buffers against network jitter, bounded by duration
//! - Status messages flow to the control thread, independent of media
//!
//! The coordinator owns all of the above and enforces the init/teardown
//! ordering.

pub mod clock;
pub mod coordinator;
pub mod health;
pub mod status;
pub mod types;

pub use clock::MediaClock;
pub use coordinator::PushCoordinator;
pub use health::PipelineHealth;
pub use status::{Recv, StatusChannel, StatusMessage};
pub use types::{EncodedPacket, MediaFrame, MediaKind};
