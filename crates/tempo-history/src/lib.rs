// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tempo History - Event Histories, Timer Firing, and Task Handoff
//!
//! The history service is the system of record for workflow executions. It
//! appends event histories, projects pending activities and timers into
//! mutable state, durably fires timeouts, and hands decision and activity
//! tasks to the matching service.
//!
//! # Architecture
//!
//! ```text
//!                 engine operations (start, record, respond, signal, ...)
//!                                      │
//!                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          HistoryService (one shard)                      │
//! │                                                                          │
//! │  ┌──────────────┐   conditional updates    ┌──────────────────────────┐  │
//! │  │ ShardContext │◄─────────────────────────│       HistoryEngine       │  │
//! │  │ range lease  │                          │ history/mutable-state/    │  │
//! │  │ sequence ids │                          │ timer builders            │  │
//! │  └──────┬───────┘                          └──────────────────────────┘  │
//! │         │                                                                │
//! │  ┌──────▼───────────────┐        ┌────────────────────────────┐          │
//! │  │ TimerQueueProcessor  │        │  TransferQueueProcessor    │──► matching
//! │  │ fires due timeouts   │        │  drains task handoffs      │          │
//! │  └──────────────────────┘        └────────────────────────────┘          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                      │
//!                                      ▼
//!                        ShardStore · ExecutionStore · VisibilityStore
//! ```
//!
//! # Consistency model
//!
//! Every write that mutates ordered state carries the shard's `range_id`
//! lease; the store rejects stale owners and the context treats rejection as
//! fatal. Per workflow, every mutation is a conditional update on
//! `next_event_id`: concurrent attempts from the timer queue and the engine
//! are resolved by retrying the loser against re-read state. Timer firing is
//! at-least-once with at-most-once effect.

#![deny(missing_docs)]

/// History engine operations: the produced service surface.
pub mod engine;

/// Append-only event history builder.
pub mod history_builder;

/// Staged-mutation builder over the mutable-state projection.
pub mod mutable_state;

/// Shard-level wiring: context, processors, and engine together.
pub mod service;

/// Shard context: range leases and monotonic sequence allocation.
pub mod shard;

/// Timer task derivation from events and mutable state.
pub mod timer_builder;

/// Timer queue processor: durable timeout firing.
pub mod timer_queue;

/// Transfer queue processor: task handoff to matching.
pub mod transfer_queue;

pub use engine::HistoryEngine;
pub use history_builder::HistoryBuilder;
pub use mutable_state::MutableStateBuilder;
pub use service::{HistoryService, HistoryServiceBuilder};
pub use shard::ShardContext;
pub use timer_builder::{LocalSequenceNumberGenerator, TimerBuilder};
pub use timer_queue::{TimerQueueProcessor, TimerQueueProcessorConfig};
pub use transfer_queue::{TransferQueueProcessor, TransferQueueProcessorConfig};
