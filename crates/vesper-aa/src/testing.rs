//! In-process doubles for the chain, bundler, sponsor and wallet.
//!
//! `MockBundler::with_chain` makes submitted operations take effect on the
//! `MockChain`: the sender's nonce advances and init code deploys the account.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use vesper_chain::abi::{decode_address, selector, uint_word};
use vesper_chain::{LocalKeySigner, RpcError, Signer, SignerError};
use vesper_common::{Address, Hash32};

use crate::bundler::{BundlerClient, BundlerError, GasEstimate, UserOpReceipt, UserOperation};
use crate::paymaster::{PaymasterError, Sponsor, Sponsorship};

pub const ENTRY_POINT: Address = [0xE7; 20];
pub const CHAIN_ID: u64 = 31337;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serves the given JSON bodies in order (repeating the last) on an ephemeral port.
pub async fn mock_rpc_server(responses: Vec<&'static str>) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("mock server bind: {e}"),
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    let counter = Arc::new(AtomicU32::new(0));

    tokio::spawn(async move {
        for _ in 0..16 {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let idx = counter.fetch_add(1, Ordering::SeqCst) as usize;
                let body = responses
                    .get(idx)
                    .or_else(|| responses.last())
                    .copied()
                    .unwrap_or("{}");
                let http_resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(http_resp.as_bytes()).await;
            }
        }
    });
    port
}

/// Word-encoded address return value.
pub fn address_return(addr: &Address) -> Vec<u8> {
    vesper_chain::abi::address_word(addr).to_vec()
}

/// Word-encoded uint return value.
pub fn uint_return(value: u128) -> Vec<u8> {
    uint_word(value).to_vec()
}

#[derive(Default)]
struct ChainState {
    balances: HashMap<Address, u128>,
    code: HashMap<Address, Vec<u8>>,
    nonces: HashMap<Address, u64>,
    /// Scripted `eth_call` results per (contract, selector); the last one repeats.
    calls: HashMap<(Address, [u8; 4]), VecDeque<Result<Vec<u8>, String>>>,
    gas_price: u128,
}

/// Scriptable chain. Unscripted calls return a single zero word.
pub struct MockChain {
    state: Mutex<ChainState>,
    nonce_failures: AtomicU32,
    code_lag: AtomicU32,
    nonce_reads: AtomicU32,
    code_reads: AtomicU32,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                gas_price: 1_000_000_000,
                ..Default::default()
            }),
            nonce_failures: AtomicU32::new(0),
            code_lag: AtomicU32::new(0),
            nonce_reads: AtomicU32::new(0),
            code_reads: AtomicU32::new(0),
        }
    }

    pub fn set_balance(&self, addr: &Address, wei: u128) {
        locked(&self.state).balances.insert(*addr, wei);
    }

    pub fn set_code(&self, addr: &Address, code: Vec<u8>) {
        locked(&self.state).code.insert(*addr, code);
    }

    /// Ignores read lag, for assertions.
    pub fn has_code_now(&self, addr: &Address) -> bool {
        locked(&self.state).code.get(addr).is_some_and(|c| !c.is_empty())
    }

    pub fn nonce_of(&self, addr: &Address) -> u64 {
        locked(&self.state).nonces.get(addr).copied().unwrap_or(0)
    }

    pub fn bump_nonce(&self, addr: &Address) {
        *locked(&self.state).nonces.entry(*addr).or_default() += 1;
    }

    /// Script `eth_call` results for `signature` on `contract`. The last result repeats.
    pub fn script_call(&self, contract: &Address, signature: &str, results: Vec<Result<Vec<u8>, String>>) {
        locked(&self.state)
            .calls
            .insert((*contract, selector(signature)), results.into());
    }

    pub fn set_call(&self, contract: &Address, signature: &str, result: Vec<u8>) {
        self.script_call(contract, signature, vec![Ok(result)]);
    }

    /// The next `n` nonce reads fail with a transport error.
    pub fn fail_nonce_reads(&self, n: u32) {
        self.nonce_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` code reads see no code, as if the node lags.
    pub fn lag_code_reads(&self, n: u32) {
        self.code_lag.store(n, Ordering::SeqCst);
    }

    pub fn nonce_reads(&self) -> u32 {
        self.nonce_reads.load(Ordering::SeqCst)
    }

    pub fn code_reads(&self) -> u32 {
        self.code_reads.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl vesper_chain::ChainReader for MockChain {
    async fn get_balance(&self, address: &Address) -> Result<u128, RpcError> {
        Ok(locked(&self.state).balances.get(address).copied().unwrap_or(0))
    }

    async fn get_code(&self, address: &Address) -> Result<Vec<u8>, RpcError> {
        self.code_reads.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.code_lag) {
            return Ok(vec![]);
        }
        Ok(locked(&self.state).code.get(address).cloned().unwrap_or_default())
    }

    async fn read_contract(&self, address: &Address, call_data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let sel: [u8; 4] = call_data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| RpcError::JsonRpc {
                code: -32602,
                message: "call data too short".into(),
            })?;

        if *address == ENTRY_POINT && sel == selector("getNonce(address,uint192)") {
            self.nonce_reads.fetch_add(1, Ordering::SeqCst);
            if Self::take(&self.nonce_failures) {
                return Err(RpcError::Http("connection reset".into()));
            }
            let sender = decode_address(&call_data[4..], 0).unwrap_or_default();
            return Ok(uint_return(self.nonce_of(&sender) as u128));
        }

        let mut state = locked(&self.state);
        match state.calls.get_mut(&(*address, sel)) {
            Some(queue) => {
                let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
                match next {
                    Some(Ok(data)) => Ok(data),
                    Some(Err(message)) => Err(RpcError::JsonRpc { code: 3, message }),
                    None => Ok(vec![0u8; 32]),
                }
            }
            None => Ok(vec![0u8; 32]),
        }
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(locked(&self.state).gas_price)
    }
}

type SendHook = Box<dyn Fn(&UserOperation) + Send + Sync>;

#[derive(Default)]
struct BundlerState {
    sent: Vec<UserOperation>,
    send_failures: VecDeque<String>,
    estimate_failure: Option<String>,
    receipt: Option<UserOpReceipt>,
    transaction_hash: Option<Hash32>,
}

/// Records submitted operations. Receipts and tx hashes resolve only when scripted.
pub struct MockBundler {
    chain: Option<Arc<MockChain>>,
    on_send: Option<SendHook>,
    send_delay: Duration,
    state: Mutex<BundlerState>,
    send_calls: AtomicU32,
    receipt_calls: AtomicU32,
    by_hash_calls: AtomicU32,
}

impl Default for MockBundler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBundler {
    pub fn new() -> Self {
        Self {
            chain: None,
            on_send: None,
            send_delay: Duration::ZERO,
            state: Mutex::new(BundlerState::default()),
            send_calls: AtomicU32::new(0),
            receipt_calls: AtomicU32::new(0),
            by_hash_calls: AtomicU32::new(0),
        }
    }

    pub fn with_chain(mut self, chain: Arc<MockChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Runs after each successful submission.
    pub fn on_send(mut self, hook: impl Fn(&UserOperation) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Box::new(hook));
        self
    }

    pub fn fail_next_send(&self, message: &str) {
        locked(&self.state).send_failures.push_back(message.to_string());
    }

    pub fn fail_estimates(&self, message: &str) {
        locked(&self.state).estimate_failure = Some(message.to_string());
    }

    pub fn set_receipt(&self, receipt: UserOpReceipt) {
        locked(&self.state).receipt = Some(receipt);
    }

    pub fn set_transaction_hash(&self, hash: Hash32) {
        locked(&self.state).transaction_hash = Some(hash);
    }

    pub fn sent(&self) -> Vec<UserOperation> {
        locked(&self.state).sent.clone()
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_calls(&self) -> u32 {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    pub fn by_hash_calls(&self) -> u32 {
        self.by_hash_calls.load(Ordering::SeqCst)
    }
}

fn rejected(message: String) -> BundlerError {
    BundlerError::Rpc(RpcError::JsonRpc { code: -32500, message })
}

#[async_trait]
impl BundlerClient for MockBundler {
    async fn estimate_gas(&self, _op: &UserOperation, _entry_point: &Address) -> Result<GasEstimate, BundlerError> {
        if let Some(message) = locked(&self.state).estimate_failure.clone() {
            return Err(rejected(message));
        }
        Ok(GasEstimate {
            call_gas_limit: 100_000,
            verification_gas_limit: 150_000,
            pre_verification_gas: 50_000,
        })
    }

    async fn send(&self, op: &UserOperation, entry_point: &Address) -> Result<Hash32, BundlerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if let Some(message) = locked(&self.state).send_failures.pop_front() {
            return Err(rejected(message));
        }
        locked(&self.state).sent.push(op.clone());
        if let Some(chain) = &self.chain {
            chain.bump_nonce(&op.sender);
            if !op.init_code.is_empty() {
                chain.set_code(&op.sender, vec![0x60, 0x80]);
            }
        }
        if let Some(hook) = &self.on_send {
            hook(op);
        }
        Ok(op.hash(entry_point, CHAIN_ID))
    }

    async fn receipt(&self, _op_hash: &Hash32) -> Result<Option<UserOpReceipt>, BundlerError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.state).receipt.clone())
    }

    async fn transaction_hash(&self, _op_hash: &Hash32) -> Result<Option<Hash32>, BundlerError> {
        self.by_hash_calls.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.state).transaction_hash)
    }
}

/// Sponsors everything unless told to fail.
#[derive(Default)]
pub struct MockSponsor {
    failure: Mutex<Option<PaymasterError>>,
    calls: AtomicU32,
}

impl MockSponsor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, err: PaymasterError) {
        *locked(&self.failure) = Some(err);
    }

    pub fn recover(&self) {
        *locked(&self.failure) = None;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sponsor for MockSponsor {
    async fn sponsor(&self, _op: &UserOperation, _entry_point: &Address) -> Result<Sponsorship, PaymasterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = locked(&self.failure).clone() {
            return Err(err);
        }
        let mut paymaster_and_data = vec![0xBB; 20];
        paymaster_and_data.extend_from_slice(&[0x01; 8]);
        Ok(Sponsorship {
            paymaster_and_data,
            gas: None,
        })
    }
}

/// A wallet stand-in: real signatures, counts every prompt, can be told to refuse.
pub struct PromptCountingSigner {
    key: LocalKeySigner,
    prompts: AtomicU32,
    reject_next: AtomicBool,
}

impl Default for PromptCountingSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptCountingSigner {
    pub fn new() -> Self {
        Self {
            key: LocalKeySigner::generate(),
            prompts: AtomicU32::new(0),
            reject_next: AtomicBool::new(false),
        }
    }

    pub fn prompts(&self) -> u32 {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Signer for PromptCountingSigner {
    fn address(&self) -> Address {
        self.key.address()
    }

    async fn sign_hash(&self, hash: &Hash32) -> Result<Vec<u8>, SignerError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(SignerError::Rejected);
        }
        self.key.sign_hash(hash).await
    }

    fn is_interactive(&self) -> bool {
        true
    }
}
