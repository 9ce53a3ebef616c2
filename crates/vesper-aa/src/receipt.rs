use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use vesper_common::{format_hash, Hash32};

use crate::bundler::{BundlerClient, BundlerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Included in a bundle transaction, receipt not yet available.
    Pending,
    Confirmed,
    /// Nothing resolved within the wait; reconcile later by operation hash.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub operation_hash: Hash32,
    pub transaction_hash: Option<Hash32>,
    pub status: ReceiptStatus,
    /// Execution outcome, known only once confirmed.
    pub success: Option<bool>,
}

impl TransactionReceipt {
    pub fn unknown(operation_hash: Hash32) -> Self {
        Self {
            operation_hash,
            transaction_hash: None,
            status: ReceiptStatus::Unknown,
            success: None,
        }
    }

    /// User-facing handle: the transaction hash when known, otherwise the operation hash.
    pub fn reference(&self) -> Hash32 {
        self.transaction_hash.unwrap_or(self.operation_hash)
    }
}

/// One way of turning an operation hash into a transaction hash.
#[async_trait]
pub trait ReceiptStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, op_hash: &Hash32) -> Result<Option<TransactionReceipt>, BundlerError>;
}

/// `eth_getUserOperationReceipt`
pub struct UserOpReceiptLookup {
    bundler: Arc<dyn BundlerClient>,
}

impl UserOpReceiptLookup {
    pub fn new(bundler: Arc<dyn BundlerClient>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl ReceiptStrategy for UserOpReceiptLookup {
    fn name(&self) -> &'static str {
        "user_op_receipt"
    }

    async fn lookup(&self, op_hash: &Hash32) -> Result<Option<TransactionReceipt>, BundlerError> {
        Ok(self.bundler.receipt(op_hash).await?.map(|r| TransactionReceipt {
            operation_hash: *op_hash,
            transaction_hash: r.transaction_hash,
            status: ReceiptStatus::Confirmed,
            success: Some(r.success),
        }))
    }
}

/// `eth_getUserOperationByHash`: sees the bundle transaction before its receipt exists.
pub struct UserOpByHashLookup {
    bundler: Arc<dyn BundlerClient>,
}

impl UserOpByHashLookup {
    pub fn new(bundler: Arc<dyn BundlerClient>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl ReceiptStrategy for UserOpByHashLookup {
    fn name(&self) -> &'static str {
        "user_op_by_hash"
    }

    async fn lookup(&self, op_hash: &Hash32) -> Result<Option<TransactionReceipt>, BundlerError> {
        Ok(self.bundler.transaction_hash(op_hash).await?.map(|tx| TransactionReceipt {
            operation_hash: *op_hash,
            transaction_hash: Some(tx),
            status: ReceiptStatus::Pending,
            success: None,
        }))
    }
}

/// Tries each strategy in order with short waits. Never fails: the
/// operation hash stands in when nothing resolves.
pub struct ReceiptResolver {
    strategies: Vec<Box<dyn ReceiptStrategy>>,
    attempts: u32,
    delay: Duration,
}

impl ReceiptResolver {
    pub fn new(strategies: Vec<Box<dyn ReceiptStrategy>>, attempts: u32, delay: Duration) -> Self {
        Self {
            strategies,
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Receipt lookup first, then lookup by hash.
    pub fn for_bundler(bundler: Arc<dyn BundlerClient>, attempts: u32, delay: Duration) -> Self {
        Self::new(
            vec![
                Box::new(UserOpReceiptLookup::new(bundler.clone())),
                Box::new(UserOpByHashLookup::new(bundler)),
            ],
            attempts,
            delay,
        )
    }

    pub async fn resolve(&self, op_hash: &Hash32) -> TransactionReceipt {
        for strategy in &self.strategies {
            for attempt in 1..=self.attempts {
                match strategy.lookup(op_hash).await {
                    Ok(Some(receipt)) => {
                        debug!(
                            op_hash = %format_hash(op_hash),
                            strategy = strategy.name(),
                            attempt,
                            status = ?receipt.status,
                            "receipt resolved"
                        );
                        return receipt;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(op_hash = %format_hash(op_hash), strategy = strategy.name(), attempt, %e, "receipt lookup failed");
                    }
                }
                if attempt < self.attempts {
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
        warn!(op_hash = %format_hash(op_hash), "transaction hash unresolved, using operation hash");
        TransactionReceipt::unknown(*op_hash)
    }
}
