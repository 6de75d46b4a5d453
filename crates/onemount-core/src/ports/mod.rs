//! Port definitions (trait interfaces for adapters)
//!
//! The engine talks to the outside world only through these traits:
//! - [`IRemoteClient`] - the object-metadata service facade
//! - [`ITokenProvider`] - bearer token supply and refresh
//! - [`IStatusPublisher`] - per-file status fan-out (desktop bus)

pub mod publisher;
pub mod remote;
pub mod token;

pub use publisher::IStatusPublisher;
pub use remote::{ChunkOutcome, DeltaBatch, DriveQuota, IRemoteClient, PushHealth, UploadTarget};
pub use token::ITokenProvider;
