//! A replicated knowledge store.
//!
//! `loam` keeps a shared key/value space that multiple independent processes
//! mutate locally and propagate to each other over unreliable, possibly
//! out-of-order links. There is no central sequencer: every externally
//! sourced update passes through one conflict-resolution choke point
//! ([`KnowledgeStore::apply`]) which decides acceptance by *quality* first
//! and by a Lamport-style logical *clock* within a quality tier. Per key,
//! accepted updates converge; across keys no ordering is guaranteed.
//!
//! The pieces, leaf first:
//!
//! * [`record`]: the tagged value ([`Value`]) plus replication metadata
//!   ([`Record`]): clock, quality, write-quality, status and scope.
//! * [`protos`]: the bit-exact wire encoding for (key, record) frames,
//!   the batch headers, and the fragmentation protocol for updates larger
//!   than a transport datagram.
//! * [`store`]: the thread-safe store and its conflict resolution.
//! * [`checkpoint`]: file save/load of the store, full or incremental,
//!   defined as replaying the file through the same `apply` path a remote
//!   update takes.
//!
//! Transports, filter pipelines and expression evaluation sit above this
//! crate and are out of scope.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod checkpoint;
pub mod protos;
pub mod record;
pub mod settings;
pub mod store;

pub use self::{
    checkpoint::{load, save, save_incremental},
    record::{Record, Scope, Status, Value, ValueKind},
    settings::{CheckpointSettings, UpdateSettings},
    store::{KnowledgeStore, UpdateOutcome},
};
