//! OneMount Graph - remote client for the object-metadata service
//!
//! Provides the async facade over Microsoft Graph:
//! - Item lookups, child listings, folder creation, delete, rename/move
//! - Streaming content download
//! - Small and chunked resumable uploads
//! - Delta queries with transparent page draining
//! - The optional websocket push channel with heartbeat health
//!
//! ## Modules
//!
//! - [`auth`] - file-backed bearer token provider
//! - [`client`] - HTTP plumbing and error categorization
//! - [`items`] - item metadata and content operations
//! - [`upload`] - small and chunked upload endpoints
//! - [`delta`] - delta queries for incremental synchronization
//! - [`subscription`] - push channel transport
//! - [`provider`] - the `IRemoteClient` port implementation

pub mod auth;
pub mod client;
pub mod delta;
pub mod items;
pub mod provider;
pub mod subscription;
pub mod upload;

pub use client::DriveClient;
pub use subscription::{PushChannel, PushChannelConfig};
