// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable history service for one shard.
//!
//! Wires a shard context, the timer and transfer queue processors, and the
//! engine together over a set of stores, so an application (or a test) can
//! run the whole history plane in-process.

use std::sync::Arc;

use tracing::info;

use tempo_core::client::MatchingClient;
use tempo_core::error::Result;
use tempo_core::persistence::{ExecutionStore, ShardStore, VisibilityStore};

use crate::engine::HistoryEngine;
use crate::shard::{DEFAULT_RANGE_SIZE, ShardContext};
use crate::timer_queue::{TimerQueueProcessor, TimerQueueProcessorConfig};
use crate::transfer_queue::{TransferQueueProcessor, TransferQueueProcessorConfig};

/// Builder for a [`HistoryService`].
pub struct HistoryServiceBuilder {
    shard_id: i32,
    range_size: i64,
    timer_config: TimerQueueProcessorConfig,
    transfer_config: TransferQueueProcessorConfig,
}

impl Default for HistoryServiceBuilder {
    fn default() -> Self {
        Self {
            shard_id: 0,
            range_size: DEFAULT_RANGE_SIZE,
            timer_config: TimerQueueProcessorConfig::default(),
            transfer_config: TransferQueueProcessorConfig::default(),
        }
    }
}

impl HistoryServiceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Which shard this service owns. Default: 0.
    pub fn shard_id(mut self, shard_id: i32) -> Self {
        self.shard_id = shard_id;
        self
    }

    /// Task ids allocated per lease epoch.
    pub fn range_size(mut self, range_size: i64) -> Self {
        self.range_size = range_size;
        self
    }

    /// Timer queue processor tuning.
    pub fn timer_config(mut self, config: TimerQueueProcessorConfig) -> Self {
        self.timer_config = config;
        self
    }

    /// Transfer queue processor tuning.
    pub fn transfer_config(mut self, config: TransferQueueProcessorConfig) -> Self {
        self.transfer_config = config;
        self
    }

    /// Acquire the shard and start both processors.
    pub async fn start(
        self,
        shard_store: Arc<dyn ShardStore>,
        execution_store: Arc<dyn ExecutionStore>,
        visibility: Arc<dyn VisibilityStore>,
        matching: Arc<dyn MatchingClient>,
    ) -> Result<HistoryService> {
        let shard = ShardContext::acquire(
            shard_store,
            execution_store.clone(),
            self.shard_id,
            self.range_size,
        )
        .await?;

        let timer_processor = TimerQueueProcessor::new(
            shard.clone(),
            execution_store.clone(),
            visibility.clone(),
            self.timer_config,
        );
        timer_processor.clone().start().await;

        let transfer_processor = TransferQueueProcessor::new(
            shard.clone(),
            execution_store.clone(),
            matching,
            self.transfer_config,
        );
        transfer_processor.clone().start().await;

        let engine = Arc::new(HistoryEngine::new(
            shard.clone(),
            execution_store,
            visibility,
            timer_processor.clone(),
        ));

        info!(shard_id = self.shard_id, "history service started");
        Ok(HistoryService {
            shard,
            engine,
            timer_processor,
            transfer_processor,
        })
    }
}

/// A running history service for one shard.
pub struct HistoryService {
    shard: Arc<ShardContext>,
    engine: Arc<HistoryEngine>,
    timer_processor: Arc<TimerQueueProcessor>,
    transfer_processor: Arc<TransferQueueProcessor>,
}

impl HistoryService {
    /// Create a builder for configuring the service.
    pub fn builder() -> HistoryServiceBuilder {
        HistoryServiceBuilder::new()
    }

    /// The engine exposing the operation surface.
    pub fn engine(&self) -> &Arc<HistoryEngine> {
        &self.engine
    }

    /// The shard this service owns.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// The timer queue processor; tests read its fired counter.
    pub fn timer_processor(&self) -> &Arc<TimerQueueProcessor> {
        &self.timer_processor
    }

    /// Stop both processors after their current cycles.
    pub async fn shutdown(&self) {
        self.timer_processor.stop().await;
        self.transfer_processor.stop().await;
        info!(shard_id = self.shard.shard_id(), "history service stopped");
    }
}
