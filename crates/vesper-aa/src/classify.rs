//! Maps raw bundler, paymaster, wallet and node error text onto a small set
//! of actionable kinds with stable user-facing messages.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PreconditionMissing,
    InsufficientFunds,
    NonceReadFailed,
    SponsorRejected,
    SigningRejectedByUser,
    AlreadyExists,
    SubmissionFailed,
    Unknown,
}

impl ErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::PreconditionMissing => "Connect your wallet and try again.",
            ErrorKind::InsufficientFunds => "Insufficient funds for this action.",
            ErrorKind::NonceReadFailed => "Network busy, please retry in a moment.",
            ErrorKind::SponsorRejected => "Gas sponsorship was declined for this action.",
            ErrorKind::SigningRejectedByUser => "Signature request was cancelled.",
            ErrorKind::AlreadyExists => "This already exists.",
            ErrorKind::SubmissionFailed => "The transaction could not be submitted.",
            ErrorKind::Unknown => "Something went wrong. Please try again.",
        }
    }

    /// User cancellations are surfaced without error styling.
    pub fn is_silent(&self) -> bool {
        matches!(self, ErrorKind::SigningRejectedByUser)
    }

    /// Whether asking the user to try again can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NonceReadFailed | ErrorKind::SubmissionFailed | ErrorKind::Unknown
        )
    }
}

/// Why a sponsor declined, distinguished so callers can react differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SponsorFailure {
    BudgetExhausted,
    InvalidSignature,
    PolicyRejected,
}

const USER_REJECTION: &[&str] = &[
    "user rejected",
    "user denied",
    "denied transaction",
    "rejected the request",
    "request rejected",
    "user cancelled",
    "user canceled",
];

// EIP-1193 code 4001, as wallets and JSON-RPC errors render it
const USER_REJECTION_CODE: &[&str] = &["code 4001", "code: 4001", "\"code\":4001", "error 4001"];

const ALREADY_EXISTS: &[&str] = &[
    "already exists",
    "already used",
    "already registered",
    "already created",
    "already deployed",
    "already constructed",
    "alreadyexists",
];

const INSUFFICIENT_FUNDS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "exceeds balance",
    "aa21",
];

const NONCE: &[&str] = &["aa25", "invalid nonce", "nonce too low", "nonce too high"];

// Reason keywords, applied only to text already known to come from the sponsor
const SPONSOR_BUDGET: &[&str] = &["aa31", "budget", "deposit too low", "spending limit", "quota"];

const SPONSOR_SIGNATURE: &[&str] = &["aa33", "aa34", "signature"];

// Alongside "paymaster", marks a sponsor-side rejection in bundler text
const SPONSOR_CONTEXT: &[&str] = &[
    "budget",
    "deposit",
    "signature",
    "policy",
    "sponsor",
    "denied",
    "rejected",
    "not allowed",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// True when the text reports that the target already exists (account, TBA, registration).
pub fn is_already_exists(raw: &str) -> bool {
    contains_any(&raw.to_ascii_lowercase(), ALREADY_EXISTS)
}

/// First standalone ERC-4337 `AAnn` code in lowercased text, as its two digits.
/// Hex revert data such as `0xaa31ff` does not count.
fn entry_point_code(lower: &str) -> Option<(u8, u8)> {
    let bytes = lower.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let standalone = |b: Option<&u8>| !b.is_some_and(|c| c.is_ascii_alphanumeric());
        match &bytes[i..i + 4] {
            [b'a', b'a', tens, ones]
                if tens.is_ascii_digit()
                    && ones.is_ascii_digit()
                    && standalone(i.checked_sub(1).and_then(|j| bytes.get(j)))
                    && standalone(bytes.get(i + 4)) =>
            {
                Some((tens - b'0', ones - b'0'))
            }
            _ => None,
        }
    })
}

/// Sponsor-side failure in bundler or node text: an AA3x code, or the
/// paymaster named together with a rejection reason. Account-side codes
/// (AA1x, AA2x) and call reverts belong to the user's own operation.
fn is_sponsor_failure(lower: &str) -> bool {
    match entry_point_code(lower) {
        Some((3, _)) => true,
        Some(_) => false,
        None => {
            !lower.contains("execution reverted")
                && lower.contains("paymaster")
                && contains_any(lower, SPONSOR_CONTEXT)
        }
    }
}

/// Classify raw error text. Order matters: user rejection wins over anything a
/// wallet might append, and sponsor codes win over generic revert text.
pub fn classify(raw: &str) -> ErrorKind {
    let lower = raw.to_ascii_lowercase();
    if contains_any(&lower, USER_REJECTION_CODE) || contains_any(&lower, USER_REJECTION) {
        return ErrorKind::SigningRejectedByUser;
    }
    if contains_any(&lower, ALREADY_EXISTS) {
        return ErrorKind::AlreadyExists;
    }
    if is_sponsor_failure(&lower) {
        return ErrorKind::SponsorRejected;
    }
    if contains_any(&lower, INSUFFICIENT_FUNDS) {
        return ErrorKind::InsufficientFunds;
    }
    if contains_any(&lower, NONCE) {
        return ErrorKind::NonceReadFailed;
    }
    if lower.starts_with("aa") || lower.contains("revert") || lower.contains("simulation") {
        return ErrorKind::SubmissionFailed;
    }
    ErrorKind::Unknown
}

/// Reason for a rejection already known to come from the sponsor.
/// `None` when the text names no specific reason.
pub fn classify_sponsor(raw: &str) -> Option<SponsorFailure> {
    let lower = raw.to_ascii_lowercase();
    if contains_any(&lower, SPONSOR_BUDGET) {
        Some(SponsorFailure::BudgetExhausted)
    } else if contains_any(&lower, SPONSOR_SIGNATURE) {
        Some(SponsorFailure::InvalidSignature)
    } else if lower.contains("policy") || lower.contains("not allowed") || lower.contains("denied") {
        Some(SponsorFailure::PolicyRejected)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_rejection() {
        assert_eq!(classify("User rejected the request."), ErrorKind::SigningRejectedByUser);
        assert_eq!(classify("code 4001: denied"), ErrorKind::SigningRejectedByUser);
        assert!(ErrorKind::SigningRejectedByUser.is_silent());
        assert_eq!(classify("JSON-RPC error 4001: denied"), ErrorKind::SigningRejectedByUser);
        assert_ne!(classify("reverted with data 0x40010000"), ErrorKind::SigningRejectedByUser);
        assert!(!ErrorKind::SigningRejectedByUser.is_retryable());
    }

    #[test]
    fn test_aa_codes() {
        assert_eq!(classify("AA21 didn't pay prefund"), ErrorKind::InsufficientFunds);
        assert_eq!(classify("AA25 invalid account nonce"), ErrorKind::NonceReadFailed);
        assert_eq!(classify("AA31 paymaster deposit too low"), ErrorKind::SponsorRejected);
        assert_eq!(classify("AA33 reverted (or OOG)"), ErrorKind::SponsorRejected);
        assert_eq!(classify("AA23 reverted"), ErrorKind::SubmissionFailed);
    }

    #[test]
    fn test_already_exists() {
        assert_eq!(classify("execution reverted: Token already used"), ErrorKind::AlreadyExists);
        assert!(is_already_exists("TBA Already Exists for token"));
        assert!(is_already_exists("AA10 sender already constructed"));
        assert!(is_already_exists("error AccountAlreadyExists()"));
        assert!(!is_already_exists("execution reverted"));
    }

    #[test]
    fn test_sponsor_failures_distinguished() {
        assert_eq!(classify_sponsor("AA31 paymaster deposit too low"), Some(SponsorFailure::BudgetExhausted));
        assert_eq!(classify_sponsor("policy budget exceeded"), Some(SponsorFailure::BudgetExhausted));
        assert_eq!(classify_sponsor("AA34 signature error"), Some(SponsorFailure::InvalidSignature));
        assert_eq!(classify_sponsor("operation not allowed by policy"), Some(SponsorFailure::PolicyRejected));
        assert_eq!(classify_sponsor("connection reset"), None);
    }

    #[test]
    fn test_user_caused_reverts_are_not_sponsor_rejections() {
        assert_eq!(
            classify("execution reverted: SpendingLimitEnforcer: spending limit exceeded"),
            ErrorKind::SubmissionFailed
        );
        assert_eq!(classify("AA23 reverted: invalid signature"), ErrorKind::SubmissionFailed);
        assert_eq!(
            classify("execution reverted: game policy: player not registered"),
            ErrorKind::SubmissionFailed
        );
        assert_eq!(classify("execution reverted: paymaster policy"), ErrorKind::SubmissionFailed);
        assert_eq!(classify("AA24 signature error"), ErrorKind::SubmissionFailed);
        assert_eq!(classify("execution reverted, data: 0xaa31ff00"), ErrorKind::SubmissionFailed);
    }

    #[test]
    fn test_paymaster_named_with_reason_is_sponsor_rejection() {
        assert_eq!(classify("paymaster denied: sponsorship policy"), ErrorKind::SponsorRejected);
        assert_eq!(classify("AA32 paymaster expired or not due"), ErrorKind::SponsorRejected);
        assert_eq!(classify("paymaster timeout"), ErrorKind::Unknown);
    }

    #[test]
    fn test_unknown_is_retryable_with_generic_message() {
        let kind = classify("socket hang up");
        assert_eq!(kind, ErrorKind::Unknown);
        assert!(kind.is_retryable());
        assert!(!kind.is_silent());
        assert!(!kind.user_message().is_empty());
    }
}
