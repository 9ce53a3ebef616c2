use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use vesper_chain::rpc::parse_data;
use vesper_chain::{RpcError, RpcPool};
use vesper_common::{format_address, Address};

use crate::bundler::{GasEstimate, UserOperation};
use crate::classify::{classify_sponsor, SponsorFailure};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymasterError {
    #[error("sponsorship budget exhausted: {0}")]
    BudgetExhausted(String),
    #[error("invalid paymaster signature: {0}")]
    InvalidSignature(String),
    #[error("rejected by sponsorship policy: {0}")]
    PolicyRejected(String),
    #[error("paymaster unavailable: {0}")]
    Unavailable(String),
}

impl PaymasterError {
    /// Build from a raw rejection message, keeping the sponsor's own wording.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_sponsor(&message) {
            Some(SponsorFailure::BudgetExhausted) => PaymasterError::BudgetExhausted(message),
            Some(SponsorFailure::InvalidSignature) => PaymasterError::InvalidSignature(message),
            Some(SponsorFailure::PolicyRejected) | None => PaymasterError::PolicyRejected(message),
        }
    }

    /// The sponsor could not be reached, as opposed to actively declining.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PaymasterError::Unavailable(_))
    }
}

impl From<RpcError> for PaymasterError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::JsonRpc { message, .. } => PaymasterError::from_message(message),
            other => PaymasterError::Unavailable(other.to_string()),
        }
    }
}

/// A sponsor's answer: paymaster data to attach, plus gas limits when the
/// sponsor re-estimated them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sponsorship {
    pub paymaster_and_data: Vec<u8>,
    pub gas: Option<GasEstimate>,
}

/// Gas sponsorship for user operations.
#[async_trait]
pub trait Sponsor: Send + Sync {
    async fn sponsor(&self, op: &UserOperation, entry_point: &Address) -> Result<Sponsorship, PaymasterError>;
}

/// Remote paymaster speaking `pm_sponsorUserOperation`.
pub struct HttpPaymaster {
    pool: Arc<RpcPool>,
    policy_id: Option<String>,
}

impl HttpPaymaster {
    pub fn new(pool: Arc<RpcPool>) -> Self {
        Self { pool, policy_id: None }
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    fn params(&self, op: &UserOperation, entry_point: &Address) -> Value {
        match &self.policy_id {
            Some(policy) => json!([op.to_rpc(), format_address(entry_point), { "sponsorshipPolicyId": policy }]),
            None => json!([op.to_rpc(), format_address(entry_point)]),
        }
    }
}

#[async_trait]
impl Sponsor for HttpPaymaster {
    async fn sponsor(&self, op: &UserOperation, entry_point: &Address) -> Result<Sponsorship, PaymasterError> {
        let result = self
            .pool
            .request("pm_sponsorUserOperation", self.params(op, entry_point))
            .await
            .map_err(|e| {
                warn!(sender = %format_address(&op.sender), %e, "sponsorship request failed");
                PaymasterError::from(e)
            })?;

        let data = result
            .get("paymasterAndData")
            .ok_or_else(|| PaymasterError::PolicyRejected("response without paymasterAndData".into()))?;
        let paymaster_and_data = parse_data(data)?;
        if paymaster_and_data.len() < 20 {
            return Err(PaymasterError::PolicyRejected("paymasterAndData too short".into()));
        }

        // Gas limits are optional; a partial set is ignored
        let gas = GasEstimate::from_rpc(&result).ok();
        debug!(sender = %format_address(&op.sender), regas = gas.is_some(), "operation sponsored");
        Ok(Sponsorship { paymaster_and_data, gas })
    }
}
