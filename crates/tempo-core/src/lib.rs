// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tempo Core - Shared Types and Durable Storage
//!
//! This crate holds everything the tempo services share: the workflow domain
//! model (executions, history events, tasks), the error taxonomy, configuration
//! loading, and the persistence layer with its storage backends.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐          ┌─────────────────────────┐
//! │     tempo-history     │          │      tempo-matching      │
//! │  shard context        │ transfer │  task list managers      │
//! │  timer queue          │──tasks──►│  task writer / reader    │
//! │  engine operations    │          │  long-poll dispatch      │
//! └───────────┬───────────┘          └───────────┬─────────────┘
//!             │                                  │
//!             ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     tempo-core (this crate)                  │
//! │   ShardStore · ExecutionStore · TaskStore · VisibilityStore  │
//! │              SqliteStore          MemoryStore                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Storage model
//!
//! The workflow space is partitioned into shards. Each shard is owned by one
//! process at a time through a `range_id` lease: an integer epoch that every
//! ordered write carries, and that the store compares before applying the
//! write. A stale owner is rejected with an ownership-lost error and must stop
//! writing. Task lists carry an analogous per-list lease.
//!
//! Workflow executions are mutated only through a conditional update on
//! `next_event_id`, which gives every mutation path (RPC handlers, the timer
//! queue processor) optimistic concurrency with at-most-once effect.
//!
//! # Modules
//!
//! - [`client`]: service client traits consumed across crate boundaries
//! - [`config`]: configuration from environment variables
//! - [`error`]: error taxonomy shared by every tempo crate
//! - [`events`]: workflow history events
//! - [`persistence`]: store traits, records, and the SQLite / in-memory backends
//! - [`types`]: core identifiers, enums, and the decision vocabulary

#![deny(missing_docs)]

/// Service client traits consumed across crate boundaries.
pub mod client;

/// Configuration loading from environment variables.
pub mod config;

/// Error taxonomy shared by every tempo crate.
pub mod error;

/// Workflow history events and their typed attributes.
pub mod events;

/// Store traits, records, and the SQLite / in-memory backends.
pub mod persistence;

/// Core identifiers, enums, and the decision vocabulary.
pub mod types;

pub use error::{CoreError, Result};
