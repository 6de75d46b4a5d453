//! OneMount Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `DriveItem`, `Inode` snapshots, `UploadSession`,
//!   `JournalEntry`, the per-file `FileStatus` state machine
//! - **Port definitions** - Traits for adapters: `IRemoteClient`,
//!   `ITokenProvider`, `IStatusPublisher`
//! - **Error model** - the tagged `RemoteError` kinds shared by every layer
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O dependencies.
//! Ports define trait interfaces that adapter crates implement.

pub mod config;
pub mod domain;
pub mod ports;
