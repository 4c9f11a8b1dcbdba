//! Shared core contracts for the weft overlay control plane.
//!
//! This crate defines the cross-crate vocabulary used by the hub, the result
//! buffer, the monitor, and the node agent: the data model, the lease token
//! signer, the capability validator, the operator command front-end, and the
//! opaque task/lease store.
//!
//! # API notes
//! `weft-core` is an internal crate (`publish = false`). Its public API uses a
//! few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `ipnet::Ipv4Net`, `serde_json::Value`) as part of the weft contract.

pub mod capability;
pub mod command;
pub mod model;
pub mod store;
pub mod token;

pub use capability::{CapabilityError, CapabilityValidator, ValidationReport};
pub use command::{CommandParseError, CommandParser, CommandVerb, ParsedCommand};
pub use model::{
    CapabilityToken, NodeCapabilities, NodeUsage, PeerConfiguration, PeerEntry, TaskComplexity,
    TaskLease, TaskRecord, TaskRequirements, TaskStatus,
};
pub use store::{MemoryStore, Store, StoreError};
pub use token::{LeaseClaims, LeaseSigner, LeaseTokenError};
