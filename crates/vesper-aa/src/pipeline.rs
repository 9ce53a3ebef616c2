//! Sequential user-operation pipeline: preconditions, balance pre-flight,
//! fresh nonce, preparation and sponsorship, signing, submission, and
//! best-effort receipt resolution.
//!
//! Everything before submission can be abandoned by dropping the future.
//! Submission itself is never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use vesper_chain::abi::{decode_uint, encode_call, Token};
use vesper_chain::{ChainReader, RpcError, Signer};
use vesper_common::{format_address, format_hash, Address, Hash32, ZERO_ADDRESS};

use crate::account::OperationCall;
use crate::bundler::{dummy_signature, BundlerClient, FeeEstimator, UserOperation};
use crate::error::ExecutionError;
use crate::paymaster::Sponsor;
use crate::receipt::{ReceiptResolver, TransactionReceipt};

/// Learns about accounts deployed as a side effect of their first operation.
#[async_trait]
pub trait DeploymentRecorder: Send + Sync {
    fn is_deployed(&self, owner: &Address) -> bool;

    async fn record_deployed(&self, owner: &Address);
}

/// Where to report that an operation carrying init code deployed its sender.
#[derive(Clone)]
pub struct DeploymentHook {
    pub owner: Address,
    pub recorder: Arc<dyn DeploymentRecorder>,
}

/// Who is sending and how they sign.
#[derive(Clone)]
pub struct ExecutionContext {
    pub sender: Address,
    pub signer: Option<Arc<dyn Signer>>,
    /// Present while the account is not yet deployed.
    pub init_code: Option<Vec<u8>>,
    pub on_deployed: Option<DeploymentHook>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Minimum sender balance the action needs (e.g. a mint price).
    pub required_balance: Option<u128>,
}

impl ExecuteOptions {
    pub fn requiring_balance(required: u128) -> Self {
        Self {
            required_balance: Some(required),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub entry_point: Address,
    pub chain_id: u64,
    pub nonce_attempts: u32,
    pub nonce_retry_delay: Duration,
    /// Proceed without a paymaster, paying from the account, when the sponsor is unreachable.
    pub allow_unsponsored: bool,
}

#[derive(Debug, Clone)]
pub struct SubmittedOperation {
    pub operation_hash: Hash32,
    pub nonce: u64,
    pub sponsored: bool,
    pub receipt: TransactionReceipt,
}

/// A sender's lock, dropped from the map once nobody else holds or awaits it.
struct SenderSlot<'a> {
    locks: &'a Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    sender: Address,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for SenderSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this slot are the only holders
        if locks.get(&self.sender).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(&self.sender);
        }
    }
}

pub struct ExecutionPipeline {
    reader: Arc<dyn ChainReader>,
    bundler: Arc<dyn BundlerClient>,
    sponsor: Option<Arc<dyn Sponsor>>,
    fees: FeeEstimator,
    receipts: ReceiptResolver,
    config: PipelineConfig,
    sender_locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExecutionPipeline {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        bundler: Arc<dyn BundlerClient>,
        sponsor: Option<Arc<dyn Sponsor>>,
        receipts: ReceiptResolver,
        config: PipelineConfig,
    ) -> Self {
        Self {
            reader,
            bundler,
            sponsor,
            fees: FeeEstimator::default(),
            receipts,
            config,
            sender_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fee_estimator(mut self, fees: FeeEstimator) -> Self {
        self.fees = fees;
        self
    }

    pub fn has_sponsor(&self) -> bool {
        self.sponsor.is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn reader(&self) -> &Arc<dyn ChainReader> {
        &self.reader
    }

    fn sender_slot(&self, sender: &Address) -> SenderSlot<'_> {
        let mut locks = self.sender_locks.lock().unwrap_or_else(|e| e.into_inner());
        SenderSlot {
            locks: &self.sender_locks,
            sender: *sender,
            lock: locks.entry(*sender).or_default().clone(),
        }
    }

    #[cfg(test)]
    fn tracked_senders(&self) -> usize {
        self.sender_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        call: &OperationCall,
        options: ExecuteOptions,
    ) -> Result<SubmittedOperation, ExecutionError> {
        let sender = ctx.sender;
        let signer = Self::check_preconditions(ctx)?;

        // One construction per sender at a time; later intents queue here
        let slot = self.sender_slot(&sender);
        let _guard = slot.lock.lock().await;

        if let Some(required) = options.required_balance {
            self.preflight_balance(&sender, required).await?;
        }

        // Read under the sender lock and set on the draft before estimation,
        // so bundler simulation and the signature both see the live nonce
        let nonce = self.read_nonce(&sender).await?;

        let (mut op, sponsored) = self.prepare(ctx, call, nonce).await?;

        let hash = op.hash(&self.config.entry_point, self.config.chain_id);
        debug!(sender = %format_address(&sender), step = "sign", interactive = signer.is_interactive(), "requesting signature");
        op.signature = signer.sign_hash(&hash).await.map_err(|e| {
            let err = ExecutionError::from_signer(e);
            if !err.is_silent() {
                error!(sender = %format_address(&sender), step = "sign", %err, "signing failed");
            }
            err
        })?;

        let operation_hash = self
            .bundler
            .send(&op, &self.config.entry_point)
            .await
            .map_err(|e| {
                let err = ExecutionError::from_submission(e);
                error!(sender = %format_address(&sender), nonce, step = "submit", %err, "submission failed");
                err
            })?;
        if operation_hash != hash {
            debug!(local = %format_hash(&hash), bundler = %format_hash(&operation_hash), "bundler returned a different op hash");
        }
        info!(sender = %format_address(&sender), nonce, op_hash = %format_hash(&operation_hash), sponsored, "operation submitted");

        let receipt = self.receipts.resolve(&operation_hash).await;

        if let Some(hook) = ctx.on_deployed.as_ref().filter(|_| !op.init_code.is_empty()) {
            self.observe_deployment(&sender, hook, &receipt).await;
        }

        Ok(SubmittedOperation {
            operation_hash,
            nonce,
            sponsored,
            receipt,
        })
    }

    /// An included op deployed its sender even if the call itself reverted.
    async fn observe_deployment(&self, sender: &Address, hook: &DeploymentHook, receipt: &TransactionReceipt) {
        let deployed = receipt.success.is_some()
            || match self.reader.has_code(sender).await {
                Ok(has_code) => has_code,
                Err(e) => {
                    debug!(sender = %format_address(sender), %e, step = "deploy-check", "code check failed");
                    false
                }
            };
        if deployed {
            hook.recorder.record_deployed(&hook.owner).await;
        } else {
            debug!(sender = %format_address(sender), step = "deploy-check", "deployment not visible yet");
        }
    }

    fn check_preconditions(ctx: &ExecutionContext) -> Result<Arc<dyn Signer>, ExecutionError> {
        if ctx.sender == ZERO_ADDRESS {
            return Err(ExecutionError::PreconditionMissing("no account connected".into()));
        }
        match &ctx.signer {
            Some(signer) => Ok(signer.clone()),
            None => Err(ExecutionError::PreconditionMissing("no signer available".into())),
        }
    }

    async fn preflight_balance(&self, sender: &Address, required: u128) -> Result<(), ExecutionError> {
        let available = self.balance(sender).await?;
        if available < required {
            warn!(sender = %format_address(sender), required, available, step = "preflight", "insufficient funds");
            return Err(ExecutionError::InsufficientFunds { required, available });
        }
        Ok(())
    }

    async fn balance(&self, sender: &Address) -> Result<u128, ExecutionError> {
        self.reader
            .get_balance(sender)
            .await
            .map_err(|e| ExecutionError::Unknown(format!("balance read failed: {e}")))
    }

    /// `EntryPoint.getNonce(sender, 0)` with a bounded retry.
    pub async fn read_nonce(&self, sender: &Address) -> Result<u64, ExecutionError> {
        let call = encode_call("getNonce(address,uint192)", &[Token::Address(*sender), Token::Uint(0)]);
        let attempts = self.config.nonce_attempts.max(1);
        let mut last_err = RpcError::NoEndpoints("nonce".into());

        for attempt in 1..=attempts {
            let result = self
                .reader
                .read_contract(&self.config.entry_point, &call)
                .await
                .and_then(|data| {
                    decode_uint(&data, 0)
                        .and_then(|n| u64::try_from(n).ok())
                        .ok_or_else(|| RpcError::Deserialize(format!("bad getNonce return: 0x{}", hex::encode(&data))))
                });
            match result {
                Ok(nonce) => {
                    debug!(sender = %format_address(sender), nonce, attempt, step = "nonce", "nonce read");
                    return Ok(nonce);
                }
                Err(e) => {
                    warn!(sender = %format_address(sender), attempt, %e, step = "nonce", "nonce read failed");
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.nonce_retry_delay).await;
            }
        }
        error!(sender = %format_address(sender), attempts, step = "nonce", "giving up on nonce");
        Err(ExecutionError::NonceReadFailed {
            attempts,
            source: last_err,
        })
    }

    /// Draft an op: fees, gas estimate, then sponsorship. Returns the op and whether it is sponsored.
    async fn prepare(
        &self,
        ctx: &ExecutionContext,
        call: &OperationCall,
        nonce: u64,
    ) -> Result<(UserOperation, bool), ExecutionError> {
        let entry_point = self.config.entry_point;
        let gas_price = self
            .reader
            .gas_price()
            .await
            .map_err(|e| ExecutionError::Unknown(format!("gas price read failed: {e}")))?;
        let fees = self.fees.estimate(gas_price);

        let mut op = UserOperation {
            sender: ctx.sender,
            nonce,
            init_code: ctx.init_code.clone().unwrap_or_default(),
            call_data: call.encode_execute(),
            max_fee_per_gas: fees.max_fee,
            max_priority_fee_per_gas: fees.priority_fee,
            signature: dummy_signature(),
            ..Default::default()
        };

        let estimate = self
            .bundler
            .estimate_gas(&op, &entry_point)
            .await
            .map_err(|e| {
                warn!(sender = %format_address(&ctx.sender), step = "prepare", %e, "gas estimation failed");
                ExecutionError::from_submission(e)
            })?;
        op.apply_gas(&self.fees.adjust(&estimate));
        debug!(sender = %format_address(&ctx.sender), total_gas = op.total_gas(), step = "prepare", "gas estimated");

        let sponsored = match &self.sponsor {
            Some(sponsor) => match sponsor.sponsor(&op, &entry_point).await {
                Ok(sponsorship) => {
                    op.paymaster_and_data = sponsorship.paymaster_and_data;
                    if let Some(gas) = sponsorship.gas {
                        op.apply_gas(&gas);
                    }
                    true
                }
                Err(e) if e.is_unavailable() && self.config.allow_unsponsored => {
                    warn!(sender = %format_address(&ctx.sender), %e, step = "sponsor", "sponsor unreachable, paying from account");
                    false
                }
                Err(e) => {
                    error!(sender = %format_address(&ctx.sender), %e, step = "sponsor", "sponsorship declined");
                    return Err(ExecutionError::SponsorRejected(e));
                }
            },
            None if self.config.allow_unsponsored => false,
            None => {
                return Err(ExecutionError::PreconditionMissing("no sponsor configured".into()));
            }
        };

        if !sponsored {
            self.preflight_balance(&ctx.sender, op.max_cost()).await?;
        }
        Ok((op, sponsored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use crate::paymaster::PaymasterError;
    use crate::receipt::ReceiptStatus;
    use crate::testing::{MockBundler, MockChain, MockSponsor, PromptCountingSigner, ENTRY_POINT};

    const SENDER: Address = [0x5A; 20];

    struct Harness {
        chain: Arc<MockChain>,
        bundler: Arc<MockBundler>,
        sponsor: Arc<MockSponsor>,
        signer: Arc<PromptCountingSigner>,
        pipeline: ExecutionPipeline,
    }

    fn harness(allow_unsponsored: bool) -> Harness {
        let chain = Arc::new(MockChain::new());
        chain.set_code(&SENDER, vec![0xfe]);
        let bundler = Arc::new(MockBundler::new().with_chain(chain.clone()));
        let sponsor = Arc::new(MockSponsor::new());
        let signer = Arc::new(PromptCountingSigner::new());
        let pipeline = ExecutionPipeline::new(
            chain.clone(),
            bundler.clone(),
            Some(sponsor.clone()),
            ReceiptResolver::for_bundler(bundler.clone(), 1, Duration::from_millis(1)),
            PipelineConfig {
                entry_point: ENTRY_POINT,
                chain_id: 31337,
                nonce_attempts: 3,
                nonce_retry_delay: Duration::from_millis(1),
                allow_unsponsored,
            },
        );
        Harness {
            chain,
            bundler,
            sponsor,
            signer,
            pipeline,
        }
    }

    fn ctx(h: &Harness) -> ExecutionContext {
        ExecutionContext {
            sender: SENDER,
            signer: Some(h.signer.clone()),
            init_code: None,
            on_deployed: None,
        }
    }

    fn call() -> OperationCall {
        OperationCall::new([0x77; 20], vec![0x01, 0x02])
    }

    #[tokio::test]
    async fn test_execute_happy_path() {
        let h = harness(false);
        let submitted = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(submitted.sponsored);
        assert_eq!(submitted.nonce, 0);
        assert_eq!(h.signer.prompts(), 1);

        let sent = h.bundler.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_sponsored());
        assert_eq!(sent[0].signature.len(), 65);
        assert_eq!(submitted.operation_hash, sent[0].hash(&ENTRY_POINT, 31337));
        // No receipt scripted: the op hash stands in
        assert_eq!(submitted.receipt.status, ReceiptStatus::Unknown);
    }

    #[tokio::test]
    async fn test_sequential_executions_use_distinct_nonces() {
        let h = harness(false);
        for _ in 0..3 {
            h.pipeline
                .execute(&ctx(&h), &call(), ExecuteOptions::default())
                .await
                .unwrap();
        }
        let nonces: Vec<u64> = h.bundler.sent().iter().map(|op| op.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_missing_signer_is_precondition() {
        let h = harness(false);
        let mut c = ctx(&h);
        c.signer = None;
        let err = h.pipeline.execute(&c, &call(), ExecuteOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionMissing);
        assert_eq!(h.chain.nonce_reads(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_funds_stops_before_signing() {
        let h = harness(false);
        h.chain.set_balance(&SENDER, 10);
        let err = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::requiring_balance(1_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InsufficientFunds {
                required: 1_000,
                available: 10
            }
        ));
        assert_eq!(h.signer.prompts(), 0);
        assert!(h.bundler.sent().is_empty());
    }

    #[tokio::test]
    async fn test_nonce_read_retries_then_succeeds() {
        let h = harness(false);
        h.chain.fail_nonce_reads(2);
        let submitted = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(submitted.nonce, 0);
        assert_eq!(h.chain.nonce_reads(), 3);
    }

    #[tokio::test]
    async fn test_nonce_read_gives_up() {
        let h = harness(false);
        h.chain.fail_nonce_reads(10);
        let err = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NonceReadFailed { attempts: 3, .. }));
        assert_eq!(h.signer.prompts(), 0);
    }

    #[tokio::test]
    async fn test_sponsor_rejection_is_distinct() {
        let h = harness(true);
        h.sponsor.fail_with(PaymasterError::BudgetExhausted("daily budget".into()));
        let err = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SponsorRejected);
        assert_eq!(h.signer.prompts(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_sponsor_falls_back_when_allowed() {
        let h = harness(true);
        h.chain.set_balance(&SENDER, u128::MAX / 2);
        h.sponsor.fail_with(PaymasterError::Unavailable("timeout".into()));
        let submitted = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(!submitted.sponsored);
        assert!(!h.bundler.sent()[0].is_sponsored());
    }

    #[tokio::test]
    async fn test_unreachable_sponsor_without_fallback_is_rejection() {
        let h = harness(false);
        h.sponsor.fail_with(PaymasterError::Unavailable("timeout".into()));
        let err = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SponsorRejected);
    }

    #[tokio::test]
    async fn test_user_rejection_is_silent() {
        let h = harness(false);
        h.signer.reject_next();
        let err = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_silent());
        assert!(h.bundler.sent().is_empty());
    }

    #[tokio::test]
    async fn test_submission_failure_not_retried() {
        let h = harness(false);
        h.bundler.fail_next_send("AA23 reverted: bad call");
        let err = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubmissionFailed);
        assert_eq!(h.bundler.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_undeployed_sender_carries_init_code() {
        let h = harness(false);
        let mut c = ctx(&h);
        c.sender = [0x6B; 20];
        c.init_code = Some(vec![0xAA; 24]);
        h.pipeline.execute(&c, &call(), ExecuteOptions::default()).await.unwrap();
        let sent = h.bundler.sent();
        assert_eq!(sent[0].init_code, vec![0xAA; 24]);
        assert!(h.chain.has_code_now(&[0x6B; 20]));
    }

    #[derive(Default)]
    struct RecordingRecorder {
        deployed: Mutex<Vec<Address>>,
    }

    #[async_trait]
    impl DeploymentRecorder for RecordingRecorder {
        fn is_deployed(&self, owner: &Address) -> bool {
            self.deployed.lock().unwrap().contains(owner)
        }

        async fn record_deployed(&self, owner: &Address) {
            self.deployed.lock().unwrap().push(*owner);
        }
    }

    #[tokio::test]
    async fn test_init_code_op_reports_deployment() {
        let h = harness(false);
        let recorder = Arc::new(RecordingRecorder::default());
        let owner = [0x0A; 20];
        let mut c = ctx(&h);
        c.sender = [0x6B; 20];
        c.init_code = Some(vec![0xAA; 24]);
        c.on_deployed = Some(DeploymentHook {
            owner,
            recorder: recorder.clone(),
        });

        h.pipeline.execute(&c, &call(), ExecuteOptions::default()).await.unwrap();
        assert!(recorder.is_deployed(&owner));

        // Without init code nothing is reported
        let recorder = Arc::new(RecordingRecorder::default());
        let mut c = ctx(&h);
        c.on_deployed = Some(DeploymentHook {
            owner,
            recorder: recorder.clone(),
        });
        h.pipeline.execute(&c, &call(), ExecuteOptions::default()).await.unwrap();
        assert!(!recorder.is_deployed(&owner));
    }

    #[tokio::test]
    async fn test_nonce_follows_chain_after_external_advance() {
        let h = harness(false);
        h.pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap();
        // Another device spends two nonces
        h.chain.bump_nonce(&SENDER);
        h.chain.bump_nonce(&SENDER);

        let submitted = h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(submitted.nonce, 3);
        assert_eq!(h.bundler.sent()[1].nonce, 3);
    }

    #[tokio::test]
    async fn test_sender_locks_released_after_execution() {
        let h = harness(false);
        let (ctx_a, call_a) = (ctx(&h), call());
        let (ctx_b, call_b) = (ctx(&h), call());
        let (a, b) = tokio::join!(
            h.pipeline.execute(&ctx_a, &call_a, ExecuteOptions::default()),
            h.pipeline.execute(&ctx_b, &call_b, ExecuteOptions::default()),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.pipeline.tracked_senders(), 0);

        h.signer.reject_next();
        assert!(h
            .pipeline
            .execute(&ctx(&h), &call(), ExecuteOptions::default())
            .await
            .is_err());
        assert_eq!(h.pipeline.tracked_senders(), 0);
    }
}
