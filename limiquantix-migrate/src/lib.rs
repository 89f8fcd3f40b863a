//! Intra-cluster live VM migration engine.
//!
//! This crate implements the two-sided migration state machine -- a
//! transmitter on the source host and a receiver on the destination --
//! coordinated through the handshake channel in [`wire`]. It never touches
//! the cluster database, the storage backend or the hypervisor control
//! layer directly: those are reached only through the trait seams in
//! [`collaborators`], implemented elsewhere (`limiquantix-node` wires them
//! to `limiquantix-hypervisor` and the storage manager).
//!
//! Module map:
//! - [`model`] -- VM/VBD/VDI/domain references and the transient session.
//! - [`ledger`] -- per-side resource ledgers driving guaranteed release.
//! - [`wire`] -- the length-prefixed handshake protocol.
//! - [`collaborators`] -- `ClusterDb`/`StorageOps`/`HypervisorOps`/`TaskSink`/
//!   `AbortSource`/`TelemetrySink`, plus in-memory mocks for tests.
//! - [`transmitter`] -- source-side choreography.
//! - [`receiver`] -- destination-side choreography.
//! - [`progress`] -- progress scaling and the suspend-ack handshake.
//! - [`faults`] -- deterministic fault injection for tests.
//! - [`coordinator`] -- admission and dispatch entry points.

pub mod collaborators;
pub mod coordinator;
pub mod error;
pub mod faults;
pub mod ledger;
pub mod model;
pub mod progress;
pub mod receiver;
pub mod transmitter;
pub mod wire;

pub use error::{MigrationError, Result};
pub use model::{BootRecord, Domain, MigrationSession, VbdMode, VbdRef, VdiRef, VmPowerState, VmRef};
