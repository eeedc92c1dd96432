//! In-memory ledger and signer for unit tests
//!
//! `FakeLedger` keeps a mempool keyed by (sender, nonce), applies the
//! replacement and nonce rules a geth node does, and mines on demand. Block
//! hashes encode a fork version so reorgs produce different hashes at the
//! same height.

use crate::chain::{BlockHeader, CallRequest, LedgerClient, LogEntry, ReadCall, Receipt};
use crate::error::{ChainError, EngineError, EngineResult};
use crate::tx::{BlockReference, GasPrice, SignedTransaction, TransactionRequest, TransactionSigner};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Replacements must pay at least this share of the pooled price, in percent
const REPLACEMENT_MIN_PERCENT: u64 = 110;

#[derive(Debug, Clone)]
struct Pooled {
    hash: H256,
    request: TransactionRequest,
}

#[derive(Debug, Clone)]
struct Mined {
    request: TransactionRequest,
    receipt: Receipt,
}

struct ChainState {
    head: u64,
    versions: HashMap<u64, u64>,
    account_nonce: HashMap<Address, u64>,
    reported_count: HashMap<Address, u64>,
    mempool: HashMap<(Address, u64), Pooled>,
    mined: HashMap<H256, Mined>,
    gas_price: GasPrice,
    estimate: Result<U256, ChainError>,
    send_failures: VecDeque<ChainError>,
    call_results: HashMap<Vec<u8>, Result<Bytes, ChainError>>,
    auto_mine: bool,
    auto_advance: bool,
    revert_mined: bool,
    receipt_logs: Vec<LogEntry>,
    gas_used: Option<U256>,
    count_calls: usize,
    send_calls: usize,
    read_calls: usize,
    batch_calls: usize,
    last_call_block: Option<u64>,
}

pub(crate) struct FakeLedger {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl FakeLedger {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(ChainState {
                head: 0,
                versions: HashMap::new(),
                account_nonce: HashMap::new(),
                reported_count: HashMap::new(),
                mempool: HashMap::new(),
                mined: HashMap::new(),
                gas_price: GasPrice::Legacy(U256::from(100u64)),
                estimate: Ok(U256::from(21_000u64)),
                send_failures: VecDeque::new(),
                call_results: HashMap::new(),
                auto_mine: false,
                auto_advance: false,
                revert_mined: false,
                receipt_logs: Vec::new(),
                gas_used: None,
                count_calls: 0,
                send_calls: 0,
                read_calls: 0,
                batch_calls: 0,
                last_call_block: None,
            }),
        }
    }

    pub fn set_account_nonce(&self, account: Address, nonce: u64) {
        self.state.lock().unwrap().account_nonce.insert(account, nonce);
    }

    /// Make `transaction_count` report `count` regardless of mined nonces
    pub fn set_reported_count(&self, account: Address, count: u64) {
        self.state.lock().unwrap().reported_count.insert(account, count);
    }

    pub fn set_estimate(&self, estimate: Result<U256, ChainError>) {
        self.state.lock().unwrap().estimate = estimate;
    }

    pub fn set_gas_price(&self, price: GasPrice) {
        self.state.lock().unwrap().gas_price = price;
    }

    /// Queue a rejection for the next `send_raw_transaction`
    pub fn fail_next_send(&self, err: ChainError) {
        self.state.lock().unwrap().send_failures.push_back(err);
    }

    /// Answer `eth_call`s whose data equals `data`
    pub fn set_call_result(&self, data: Vec<u8>, result: Result<Bytes, ChainError>) {
        self.state.lock().unwrap().call_results.insert(data, result);
    }

    /// Mine every accepted transaction into its own block straight away
    pub fn set_auto_mine(&self, enabled: bool) {
        self.state.lock().unwrap().auto_mine = enabled;
    }

    /// Produce an empty block on every `block_number` call
    pub fn set_auto_advance(&self, enabled: bool) {
        self.state.lock().unwrap().auto_advance = enabled;
    }

    /// Mined transactions report failed execution
    pub fn set_revert_mined(&self, revert: bool) {
        self.state.lock().unwrap().revert_mined = revert;
    }

    pub fn set_receipt_logs(&self, logs: Vec<LogEntry>) {
        self.state.lock().unwrap().receipt_logs = logs;
    }

    /// Gas used by mined transactions; half the gas limit when unset
    pub fn set_gas_used(&self, gas_used: U256) {
        self.state.lock().unwrap().gas_used = Some(gas_used);
    }

    pub fn count_calls(&self) -> usize {
        self.state.lock().unwrap().count_calls
    }

    pub fn send_calls(&self) -> usize {
        self.state.lock().unwrap().send_calls
    }

    pub fn read_calls(&self) -> usize {
        self.state.lock().unwrap().read_calls
    }

    pub fn batch_calls(&self) -> usize {
        self.state.lock().unwrap().batch_calls
    }

    pub fn last_call_block(&self) -> Option<u64> {
        self.state.lock().unwrap().last_call_block
    }

    pub fn in_mempool(&self, hash: H256) -> bool {
        self.state
            .lock()
            .unwrap()
            .mempool
            .values()
            .any(|p| p.hash == hash)
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn advance_to(&self, number: u64) {
        let mut state = self.state.lock().unwrap();
        state.head = state.head.max(number);
    }

    pub fn block_ref(&self, number: u64) -> BlockReference {
        let state = self.state.lock().unwrap();
        BlockReference {
            number,
            hash: block_hash(&state, number),
        }
    }

    /// Replace every block from `number` up to head with a sibling; mined
    /// transactions in them go back to the mempool
    pub fn reorg_from(&self, number: u64) {
        let mut state = self.state.lock().unwrap();
        for n in number..=state.head {
            *state.versions.entry(n).or_default() += 1;
        }
        unmine_from(&mut state, number);
    }

    /// Drop blocks above `number`
    pub fn rewind_to(&self, number: u64) {
        let mut state = self.state.lock().unwrap();
        state.head = number;
        unmine_from(&mut state, number + 1);
    }

    /// Mine the pooled transaction `hash` into a new block on top of head
    pub fn mine(&self, hash: H256) -> BlockReference {
        let mut state = self.state.lock().unwrap();
        mine_locked(&mut state, hash).unwrap_or_else(|| panic!("{:?} is not in the mempool", hash))
    }
}

fn block_hash(state: &ChainState, number: u64) -> H256 {
    let version = state.versions.get(&number).copied().unwrap_or(0);
    H256::from_low_u64_be((number << 16) | version)
}

fn mine_locked(state: &mut ChainState, hash: H256) -> Option<BlockReference> {
    let key = state
        .mempool
        .iter()
        .find(|(_, p)| p.hash == hash)
        .map(|(key, _)| *key)?;
    let pooled = state.mempool.remove(&key)?;

    state.head += 1;
    let block = BlockReference {
        number: state.head,
        hash: block_hash(state, state.head),
    };
    let (from, nonce) = key;
    let confirmed = state.account_nonce.entry(from).or_default();
    *confirmed = (*confirmed).max(nonce + 1);

    let receipt = Receipt {
        tx_hash: hash,
        block,
        success: !state.revert_mined,
        gas_used: state.gas_used.unwrap_or(pooled.request.gas_limit / 2),
        logs: state.receipt_logs.clone(),
    };
    state.mined.insert(
        hash,
        Mined {
            request: pooled.request,
            receipt,
        },
    );
    Some(block)
}

fn unmine_from(state: &mut ChainState, number: u64) {
    let displaced: Vec<H256> = state
        .mined
        .iter()
        .filter(|(_, m)| m.receipt.block.number >= number)
        .map(|(hash, _)| *hash)
        .collect();

    for hash in displaced {
        if let Some(mined) = state.mined.remove(&hash) {
            let key = (mined.request.from, mined.request.nonce);
            if let Some(confirmed) = state.account_nonce.get_mut(&key.0) {
                *confirmed = (*confirmed).min(key.1);
            }
            state.mempool.insert(
                key,
                Pooled {
                    hash,
                    request: mined.request,
                },
            );
        }
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.count_calls += 1;
        let count = match state.reported_count.get(&account) {
            Some(count) => *count,
            None => state.account_nonce.get(&account).copied().unwrap_or(0),
        };
        Ok(count)
    }

    async fn estimate_gas(&self, _call: &CallRequest) -> Result<U256, ChainError> {
        self.state.lock().unwrap().estimate.clone()
    }

    async fn gas_price(&self) -> Result<GasPrice, ChainError> {
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.send_calls += 1;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }

        let request: TransactionRequest = serde_json::from_slice(&raw)
            .map_err(|e| ChainError::Rejected(format!("rlp: {}", e)))?;
        let hash = H256::from(keccak256(&raw));
        let key = (request.from, request.nonce);

        if state.mined.contains_key(&hash) || state.mempool.values().any(|p| p.hash == hash) {
            return Err(ChainError::Rejected("already known".to_string()));
        }
        let confirmed = state.account_nonce.get(&request.from).copied().unwrap_or(0);
        if request.nonce < confirmed {
            return Err(ChainError::Rejected("nonce too low".to_string()));
        }
        if let Some(pooled) = state.mempool.get(&key) {
            let offered = request.gas_price.ceiling() * 100;
            let required = pooled.request.gas_price.ceiling() * REPLACEMENT_MIN_PERCENT;
            if offered < required {
                return Err(ChainError::Rejected(
                    "replacement transaction underpriced".to_string(),
                ));
            }
        }

        state.mempool.insert(key, Pooled { hash, request });
        if state.auto_mine {
            mine_locked(&mut state, hash);
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state.mined.get(&hash).map(|m| m.receipt.clone()))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.auto_advance {
            state.head += 1;
        }
        Ok(state.head)
    }

    async fn block(&self, number: u64) -> Result<Option<BlockHeader>, ChainError> {
        let state = self.state.lock().unwrap();
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(BlockHeader {
            number,
            hash: block_hash(&state, number),
            parent_hash: block_hash(&state, number.saturating_sub(1)),
        }))
    }

    async fn call(&self, call: &ReadCall) -> Result<Bytes, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.read_calls += 1;
        state.last_call_block = call.block;
        state
            .call_results
            .get(&call.data.to_vec())
            .cloned()
            .unwrap_or_else(|| Err(ChainError::Reverted("no result configured".to_string())))
    }

    async fn call_batch(
        &self,
        calls: &[ReadCall],
    ) -> Result<Vec<Result<Bytes, ChainError>>, ChainError> {
        self.state.lock().unwrap().batch_calls += 1;
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.call(call).await);
        }
        Ok(results)
    }
}

/// Signs by serializing the request, which `FakeLedger` decodes back
pub(crate) struct FakeSigner {
    address: Address,
}

impl FakeSigner {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn sign_now(&self, request: &TransactionRequest) -> SignedTransaction {
        let raw = serde_json::to_vec(request).expect("request serializes");
        let hash = H256::from(keccak256(&raw));
        SignedTransaction {
            raw: Bytes::from(raw),
            hash,
        }
    }
}

#[async_trait]
impl TransactionSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, request: &TransactionRequest) -> EngineResult<SignedTransaction> {
        if request.from != self.address {
            return Err(EngineError::Signer(format!(
                "no key for {:?}",
                request.from
            )));
        }
        Ok(self.sign_now(request))
    }
}
