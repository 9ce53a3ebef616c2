//! Background refresh of indexer-backed read state (positions, purchases,
//! mints). Runs detached; nothing in the write path awaits it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vesper_common::{hex_address, Address};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PositionChanged,
    Purchase,
    Mint,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub block: u64,
    pub kind: EventKind,
    #[serde(with = "hex_address")]
    pub account: Address,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// External indexer. `cursor` is the last block already seen.
#[async_trait]
pub trait IndexerSource: Send + Sync {
    async fn events_since(&self, cursor: u64) -> vesper_common::Result<Vec<IndexedEvent>>;
}

/// Most recent indexed events, bounded.
#[derive(Debug)]
pub struct ReadCache {
    events: VecDeque<IndexedEvent>,
    capacity: usize,
    cursor: u64,
    last_refreshed: Option<DateTime<Utc>>,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            cursor: 0,
            last_refreshed: None,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<IndexedEvent> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    pub fn for_account(&self, account: &Address) -> Vec<IndexedEvent> {
        self.events.iter().filter(|e| e.account == *account).cloned().collect()
    }

    /// Append events past the cursor; older or duplicate blocks are ignored.
    pub fn apply(&mut self, mut events: Vec<IndexedEvent>) -> usize {
        events.sort_by_key(|e| e.block);
        let mut added = 0;
        for event in events {
            if event.block <= self.cursor && self.cursor != 0 {
                continue;
            }
            if self.events.len() == self.capacity {
                self.events.pop_front();
            }
            self.events.push_back(event);
            added += 1;
        }
        if let Some(last) = self.events.back() {
            self.cursor = self.cursor.max(last.block);
        }
        self.last_refreshed = Some(Utc::now());
        added
    }
}

/// One refresh pass. Errors are logged and swallowed.
pub async fn refresh_once(source: &dyn IndexerSource, cache: &RwLock<ReadCache>) -> usize {
    let cursor = cache.read().await.cursor();
    match source.events_since(cursor).await {
        Ok(events) if events.is_empty() => 0,
        Ok(events) => {
            let added = cache.write().await.apply(events);
            debug!(cursor, added, "read cache refreshed");
            added
        }
        Err(e) => {
            warn!(cursor, %e, "indexer refresh failed");
            0
        }
    }
}

/// Refresh `cache` from `source` every `interval` until the handle is aborted.
pub fn spawn_watcher(source: Arc<dyn IndexerSource>, cache: Arc<RwLock<ReadCache>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            refresh_once(source.as_ref(), &cache).await;
        }
    })
}
