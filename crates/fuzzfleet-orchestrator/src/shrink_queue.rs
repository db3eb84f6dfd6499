// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shrink credits for scalesets and pools.
//!
//! A shrink queue holds one token per node that should be removed instead of
//! reimaged. Tokens are consumed one at a time by [`ShrinkQueue::should_shrink`]
//! with delete-on-read semantics, so concurrent consumers can under-consume but
//! never remove more nodes than were requested.

use std::sync::Arc;

use uuid::Uuid;

use crate::queue::{QueueProvider, Result};

/// Handle to the shrink queue of one scaleset or pool.
#[derive(Clone)]
pub struct ShrinkQueue {
    name: String,
    queue: Arc<dyn QueueProvider>,
}

impl ShrinkQueue {
    fn new(base_id: Uuid, queue: Arc<dyn QueueProvider>) -> Self {
        Self {
            name: format!("to-shrink-{}", base_id.simple()),
            queue,
        }
    }

    /// Shrink queue of a scaleset.
    pub fn for_scaleset(scaleset_id: Uuid, queue: Arc<dyn QueueProvider>) -> Self {
        Self::new(scaleset_id, queue)
    }

    /// Shrink queue of a pool.
    pub fn for_pool(pool_id: Uuid, queue: Arc<dyn QueueProvider>) -> Self {
        Self::new(pool_id, queue)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the queue if missing.
    pub async fn create(&self) -> Result<()> {
        self.queue.create_queue(&self.name).await
    }

    /// Drop every pending token.
    pub async fn clear(&self) -> Result<()> {
        self.queue.clear_queue(&self.name).await
    }

    /// Delete the queue.
    pub async fn delete(&self) -> Result<()> {
        self.queue.delete_queue(&self.name).await.map(|_| ())
    }

    /// Add one token.
    pub async fn add_entry(&self) -> Result<()> {
        self.queue
            .send_message(&self.name, Uuid::new_v4().to_string())
            .await
    }

    /// Replace pending tokens with exactly `size` new ones.
    pub async fn set_size(&self, size: u32) -> Result<()> {
        self.clear().await?;
        for _ in 0..size {
            self.add_entry().await?;
        }
        Ok(())
    }

    /// Consume one token. Returns `true` if a token was available.
    pub async fn should_shrink(&self) -> Result<bool> {
        Ok(self.queue.receive_message(&self.name).await?.is_some())
    }

    /// Pending tokens.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.queue.queue_len(&self.name).await?.unwrap_or(0))
    }

    /// True when no tokens are pending.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn test_set_size_is_consumed_exactly_once() {
        for n in [0u32, 1, 3, 7] {
            let shrink = ShrinkQueue::for_scaleset(Uuid::new_v4(), Arc::new(MemoryQueue::new()));
            shrink.create().await.unwrap();
            shrink.set_size(n).await.unwrap();

            for _ in 0..n {
                assert!(shrink.should_shrink().await.unwrap());
            }
            assert!(!shrink.should_shrink().await.unwrap());
            assert!(!shrink.should_shrink().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_set_size_replaces_previous_tokens() {
        let shrink = ShrinkQueue::for_pool(Uuid::new_v4(), Arc::new(MemoryQueue::new()));
        shrink.create().await.unwrap();
        shrink.set_size(5).await.unwrap();
        shrink.set_size(2).await.unwrap();
        assert_eq!(shrink.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_queue_never_shrinks() {
        let shrink = ShrinkQueue::for_scaleset(Uuid::new_v4(), Arc::new(MemoryQueue::new()));
        assert!(!shrink.should_shrink().await.unwrap());
        assert!(shrink.is_empty().await.unwrap());
    }

    #[test]
    fn test_queue_name() {
        let id = Uuid::nil();
        let shrink = ShrinkQueue::for_scaleset(id, Arc::new(MemoryQueue::new()));
        assert_eq!(shrink.name(), format!("to-shrink-{}", id.simple()));
    }
}
