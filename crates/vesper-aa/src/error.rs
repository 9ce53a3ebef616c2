use thiserror::Error;
use vesper_chain::{RpcError, SignerError};

use crate::bundler::BundlerError;
use crate::classify::{classify, ErrorKind};
use crate::paymaster::PaymasterError;

/// Failure of an operation through the execution pipeline.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("precondition missing: {0}")]
    PreconditionMissing(String),
    #[error("insufficient funds: required {required} wei, available {available} wei")]
    InsufficientFunds { required: u128, available: u128 },
    #[error("nonce read failed after {attempts} attempts: {source}")]
    NonceReadFailed { attempts: u32, source: RpcError },
    #[error("sponsor rejected operation: {0}")]
    SponsorRejected(#[from] PaymasterError),
    #[error("signature rejected by user")]
    SigningRejectedByUser,
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    #[error("{0}")]
    Unknown(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::PreconditionMissing(_) => ErrorKind::PreconditionMissing,
            ExecutionError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            ExecutionError::NonceReadFailed { .. } => ErrorKind::NonceReadFailed,
            ExecutionError::SponsorRejected(_) => ErrorKind::SponsorRejected,
            ExecutionError::SigningRejectedByUser => ErrorKind::SigningRejectedByUser,
            ExecutionError::SubmissionFailed(raw) => match classify(raw) {
                ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                _ => ErrorKind::SubmissionFailed,
            },
            ExecutionError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ExecutionError::InsufficientFunds { required, available } => format!(
                "Insufficient funds: {required} wei required, {available} wei available."
            ),
            other => other.kind().user_message().to_string(),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.kind().is_silent()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Map a bundler failure at submission. Sponsor codes keep their own kind.
    pub(crate) fn from_submission(err: BundlerError) -> Self {
        let raw = err.raw_message();
        match classify(&raw) {
            ErrorKind::SponsorRejected => ExecutionError::SponsorRejected(PaymasterError::from_message(raw)),
            ErrorKind::SigningRejectedByUser => ExecutionError::SigningRejectedByUser,
            _ if matches!(err, BundlerError::Rpc(ref e) if e.is_transport()) => {
                ExecutionError::Unknown(raw)
            }
            _ => ExecutionError::SubmissionFailed(raw),
        }
    }

    pub(crate) fn from_signer(err: SignerError) -> Self {
        match err {
            SignerError::Rejected => ExecutionError::SigningRejectedByUser,
            SignerError::Unavailable(msg) => ExecutionError::PreconditionMissing(format!("signer unavailable: {msg}")),
            other => match classify(&other.to_string()) {
                ErrorKind::SigningRejectedByUser => ExecutionError::SigningRejectedByUser,
                _ => ExecutionError::Unknown(other.to_string()),
            },
        }
    }
}
