// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named message queues used for work sets and shrink tokens.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The queue has not been created.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Generic queue backend.
///
/// `receive` removes the message it returns, so two consumers can never both
/// see the same message.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Create a queue. Existing queues are left untouched.
    async fn create_queue(&self, name: &str) -> Result<()>;

    /// Delete a queue and its messages. Returns `false` if it did not exist.
    async fn delete_queue(&self, name: &str) -> Result<bool>;

    /// Drop every message. Missing queues are ignored.
    async fn clear_queue(&self, name: &str) -> Result<()>;

    /// Append a message.
    async fn send_message(&self, name: &str, message: String) -> Result<()>;

    /// Remove and return the oldest message. `None` when empty or missing.
    async fn receive_message(&self, name: &str) -> Result<Option<String>>;

    /// Return up to `max` messages without removing them.
    async fn peek_messages(&self, name: &str, max: usize) -> Result<Vec<String>>;

    /// Number of messages, `None` if the queue does not exist.
    async fn queue_len(&self, name: &str) -> Result<Option<usize>>;
}

/// In-memory queue backend.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl MemoryQueue {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the queue exists.
    pub async fn exists(&self, name: &str) -> bool {
        self.queues.lock().await.contains_key(name)
    }
}

#[async_trait]
impl QueueProvider for MemoryQueue {
    async fn create_queue(&self, name: &str) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<bool> {
        Ok(self.queues.lock().await.remove(name).is_some())
    }

    async fn clear_queue(&self, name: &str) -> Result<()> {
        if let Some(queue) = self.queues.lock().await.get_mut(name) {
            queue.clear();
        }
        Ok(())
    }

    async fn send_message(&self, name: &str, message: String) -> Result<()> {
        self.queues
            .lock()
            .await
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?
            .push_back(message);
        Ok(())
    }

    async fn receive_message(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(name)
            .and_then(VecDeque::pop_front))
    }

    async fn peek_messages(&self, name: &str, max: usize) -> Result<Vec<String>> {
        Ok(self
            .queues
            .lock()
            .await
            .get(name)
            .map(|q| q.iter().take(max).cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_len(&self, name: &str) -> Result<Option<usize>> {
        Ok(self.queues.lock().await.get(name).map(VecDeque::len))
    }
}
