//! Transaction requests, records and the record lifecycle state machine

use super::policy::{StuckAction, VerificationSpec};
use crate::error::{EngineError, EngineResult};

use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Gas for a plain value transfer
pub const TRANSFER_GAS: u64 = 21_000;

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Scale every component by `percent` (120 = x1.2). Below `U256::MAX` the result
    /// is always strictly higher than the input so replacements are never rejected as equal.
    pub fn bump(&self, percent: u64) -> GasPrice {
        let percent = U256::from(percent);
        let scale = |value: U256| {
            let scaled = match value.checked_mul(percent) {
                Some(product) => product / 100,
                None => (value / 100).saturating_mul(percent),
            };
            if scaled > value {
                scaled
            } else {
                value.saturating_add(U256::one())
            }
        };

        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy(scale(*price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: scale(*max_fee_per_gas),
                max_priority_fee_per_gas: scale(*max_priority_fee_per_gas),
            },
        }
    }

    /// Component-wise maximum with `floor` when both use the same fee model
    pub fn at_least(&self, floor: &GasPrice) -> GasPrice {
        match (self, floor) {
            (GasPrice::Legacy(a), GasPrice::Legacy(b)) => GasPrice::Legacy((*a).max(*b)),
            (
                GasPrice::Eip1559 {
                    max_fee_per_gas: fee_a,
                    max_priority_fee_per_gas: tip_a,
                },
                GasPrice::Eip1559 {
                    max_fee_per_gas: fee_b,
                    max_priority_fee_per_gas: tip_b,
                },
            ) => GasPrice::Eip1559 {
                max_fee_per_gas: (*fee_a).max(*fee_b),
                max_priority_fee_per_gas: (*tip_a).max(*tip_b),
            },
            _ => *self,
        }
    }

    /// Highest per-gas price the sender can be charged
    pub fn ceiling(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Block number + hash, used to detect displacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockReference {
    pub number: u64,
    pub hash: H256,
}

impl fmt::Display for BlockReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({:?})", self.number, self.hash)
    }
}

/// Unsigned transaction, immutable once signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: U256,
    pub gas_price: GasPrice,
    pub nonce: u64,
}

impl TransactionRequest {
    pub fn with_gas_price(&self, gas_price: GasPrice) -> Self {
        Self {
            gas_price,
            ..self.clone()
        }
    }

    pub fn with_nonce(&self, nonce: u64) -> Self {
        Self {
            nonce,
            ..self.clone()
        }
    }

    /// Zero-value self-transfer that consumes this request's nonce
    pub fn cancellation(&self, gas_price: GasPrice) -> Self {
        Self {
            chain_id: self.chain_id,
            from: self.from,
            to: self.from,
            value: U256::zero(),
            data: Bytes::default(),
            gas_limit: U256::from(TRANSFER_GAS),
            gas_price,
            nonce: self.nonce,
        }
    }

    pub fn to_typed(&self) -> TypedTransaction {
        match self.gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                ethers::types::TransactionRequest::new()
                    .from(self.from)
                    .to(self.to)
                    .value(self.value)
                    .data(self.data.clone())
                    .nonce(self.nonce)
                    .gas(self.gas_limit)
                    .gas_price(price)
                    .chain_id(self.chain_id),
            ),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(self.from)
                    .to(self.to)
                    .value(self.value)
                    .data(self.data.clone())
                    .nonce(self.nonce)
                    .gas(self.gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(self.chain_id),
            ),
        }
    }
}

/// Lifecycle state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Built,
    Signed,
    Broadcast,
    Pending,
    Included,
    Confirming,
    Confirmed,
    Replaced,
    Failed,
}

impl TxStatus {
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;

        matches!(
            (self, next),
            (Built, Signed)
                | (Built, Failed)
                | (Signed, Broadcast)
                | (Signed, Built)
                | (Signed, Failed)
                | (Broadcast, Pending)
                | (Broadcast, Built)
                | (Broadcast, Failed)
                | (Pending, Included)
                | (Pending, Replaced)
                | (Pending, Failed)
                | (Included, Confirming)
                | (Included, Pending)
                | (Included, Failed)
                | (Confirming, Confirmed)
                | (Confirming, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Replaced | TxStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Built => "built",
            TxStatus::Signed => "signed",
            TxStatus::Broadcast => "broadcast",
            TxStatus::Pending => "pending",
            TxStatus::Included => "included",
            TxStatus::Confirming => "confirming",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Replaced => "replaced",
            TxStatus::Failed => "failed",
        }
    }

    pub const ALL: [TxStatus; 9] = [
        TxStatus::Built,
        TxStatus::Signed,
        TxStatus::Broadcast,
        TxStatus::Pending,
        TxStatus::Included,
        TxStatus::Confirming,
        TxStatus::Confirmed,
        TxStatus::Replaced,
        TxStatus::Failed,
    ];
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Original,
    Accelerated,
    Cancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Included,
    Replaced,
}

/// One broadcast of the record's nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub kind: AttemptKind,
    pub tx_hash: H256,
    pub gas_price: GasPrice,
    pub gas_limit: U256,
    pub status: AttemptStatus,
    pub submitted_at: DateTime<Utc>,
}

/// One logical user intent and everything observed about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    /// Request of the latest attempt
    pub request: TransactionRequest,
    pub status: TxStatus,
    pub inclusion: Option<BlockReference>,
    pub attempts: Vec<Attempt>,
    pub confirmations: u64,
    pub required_confirmations: u64,
    /// Why the record reached its terminal state
    pub reason: Option<String>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub verification: Option<VerificationSpec>,
    #[serde(default)]
    pub stuck_action: Option<StuckAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(request: TransactionRequest, required_confirmations: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            status: TxStatus::Built,
            inclusion: None,
            attempts: Vec::new(),
            confirmations: 0,
            required_confirmations,
            reason: None,
            warnings: Vec::new(),
            verification: None,
            stuck_action: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn account(&self) -> Address {
        self.request.from
    }

    pub fn nonce(&self) -> u64 {
        self.request.nonce
    }

    /// Signed payload hash of the latest attempt
    pub fn tx_hash(&self) -> Option<H256> {
        self.attempts.last().map(|a| a.tx_hash)
    }

    pub fn latest_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn is_cancelling(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| a.kind == AttemptKind::Cancellation)
    }

    pub fn transition(&mut self, next: TxStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `Failed`, keeping the error as the terminal reason
    pub fn fail(&mut self, error: &EngineError) -> EngineResult<()> {
        self.transition(TxStatus::Failed)?;
        self.reason = Some(error.to_string());
        Ok(())
    }

    pub fn push_attempt(&mut self, kind: AttemptKind, tx_hash: H256, request: TransactionRequest) -> u32 {
        let number = self.attempt_count() + 1;
        self.attempts.push(Attempt {
            number,
            kind,
            tx_hash,
            gas_price: request.gas_price,
            gas_limit: request.gas_limit,
            status: AttemptStatus::Pending,
            submitted_at: Utc::now(),
        });
        self.request = request;
        self.updated_at = Utc::now();
        number
    }

    /// Record the inclusion of `tx_hash`; every other attempt becomes `Replaced`
    pub fn mark_included(&mut self, tx_hash: H256, block: BlockReference) -> EngineResult<()> {
        self.transition(TxStatus::Included)?;
        for attempt in &mut self.attempts {
            attempt.status = if attempt.tx_hash == tx_hash {
                AttemptStatus::Included
            } else {
                AttemptStatus::Replaced
            };
        }
        self.inclusion = Some(block);
        self.confirmations = 0;
        Ok(())
    }

    /// A cancellation won the nonce: the intent will never execute
    pub fn mark_cancelled(&mut self, tx_hash: H256, block: BlockReference) -> EngineResult<()> {
        self.transition(TxStatus::Replaced)?;
        for attempt in &mut self.attempts {
            attempt.status = if attempt.tx_hash == tx_hash {
                AttemptStatus::Included
            } else {
                AttemptStatus::Replaced
            };
        }
        self.inclusion = Some(block);
        self.reason = Some(format!(
            "nonce {} consumed by cancellation {:?} in block {}",
            self.request.nonce, tx_hash, block
        ));
        Ok(())
    }

    /// Reorg displaced the inclusion block: back to `Pending`, depth restarts
    pub fn requeue(&mut self) -> EngineResult<()> {
        self.transition(TxStatus::Pending)?;
        for attempt in &mut self.attempts {
            attempt.status = AttemptStatus::Pending;
        }
        self.inclusion = None;
        self.confirmations = 0;
        Ok(())
    }

    /// Depth only moves forward while the inclusion block stands
    pub fn record_depth(&mut self, depth: u64) -> u64 {
        if depth > self.confirmations {
            self.confirmations = depth;
            self.updated_at = Utc::now();
        }
        self.confirmations
    }

    pub fn included_attempt(&self) -> Option<&Attempt> {
        self.attempts
            .iter()
            .find(|a| a.status == AttemptStatus::Included)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransactionRequest {
        TransactionRequest {
            chain_id: 1,
            from: Address::repeat_byte(0x11),
            to: Address::repeat_byte(0x22),
            value: U256::from(1_000u64),
            data: Bytes::default(),
            gas_limit: U256::from(TRANSFER_GAS),
            gas_price: GasPrice::Legacy(U256::from(100u64)),
            nonce: 5,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut record = TransactionRecord::new(request(), 3);
        for next in [
            TxStatus::Signed,
            TxStatus::Broadcast,
            TxStatus::Pending,
        ] {
            record.transition(next).unwrap();
        }
        record
            .mark_included(H256::zero(), BlockReference { number: 10, hash: H256::repeat_byte(1) })
            .unwrap();
        record.transition(TxStatus::Confirming).unwrap();
        record.transition(TxStatus::Confirmed).unwrap();
        assert!(record.status.is_terminal());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut record = TransactionRecord::new(request(), 3);
        record
            .fail(&EngineError::Estimation {
                reason: "revert".into(),
            })
            .unwrap();
        assert!(record.reason.as_deref().unwrap().contains("revert"));

        let err = record.transition(TxStatus::Pending).unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[test]
    fn inclusion_marks_other_attempts_replaced() {
        let mut record = TransactionRecord::new(request(), 3);
        record.transition(TxStatus::Signed).unwrap();
        record.transition(TxStatus::Broadcast).unwrap();
        record.transition(TxStatus::Pending).unwrap();

        let original = H256::repeat_byte(0xaa);
        let faster = H256::repeat_byte(0xbb);
        record.push_attempt(AttemptKind::Original, original, request());
        let bumped = request().with_gas_price(GasPrice::Legacy(U256::from(120u64)));
        record.push_attempt(AttemptKind::Accelerated, faster, bumped);

        record
            .mark_included(faster, BlockReference { number: 7, hash: H256::repeat_byte(7) })
            .unwrap();
        assert_eq!(record.attempts[0].status, AttemptStatus::Replaced);
        assert_eq!(record.attempts[1].status, AttemptStatus::Included);
        assert_eq!(record.tx_hash(), Some(faster));

        record.requeue().unwrap();
        assert!(record.inclusion.is_none());
        assert!(record
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::Pending));
    }

    #[test]
    fn depth_is_monotonic() {
        let mut record = TransactionRecord::new(request(), 6);
        assert_eq!(record.record_depth(2), 2);
        assert_eq!(record.record_depth(1), 2);
        assert_eq!(record.record_depth(4), 4);
    }

    #[test]
    fn bump_is_strictly_increasing() {
        let price = GasPrice::Legacy(U256::from(100u64));
        assert_eq!(price.bump(120), GasPrice::Legacy(U256::from(120u64)));

        let tiny = GasPrice::Legacy(U256::from(1u64));
        assert_eq!(tiny.bump(110), GasPrice::Legacy(U256::from(2u64)));

        let eip = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(50u64),
            max_priority_fee_per_gas: U256::from(10u64),
        };
        assert_eq!(
            eip.bump(120),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(60u64),
                max_priority_fee_per_gas: U256::from(12u64),
            }
        );
    }

    #[test]
    fn gas_price_json_is_adjacently_tagged() {
        let legacy = GasPrice::Legacy(U256::from(100u64));
        let json = serde_json::to_value(legacy).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "legacy", "value": "0x64" }));
        assert_eq!(serde_json::from_value::<GasPrice>(json).unwrap(), legacy);

        let eip: GasPrice = serde_json::from_str(
            r#"{"type":"eip1559","value":{"max_fee_per_gas":"0x32","max_priority_fee_per_gas":"0xa"}}"#,
        )
        .unwrap();
        assert_eq!(
            eip,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(50u64),
                max_priority_fee_per_gas: U256::from(10u64),
            }
        );
    }

    #[test]
    fn record_survives_a_json_round_trip() {
        let mut record = TransactionRecord::new(request(), 3);
        record.transition(TxStatus::Signed).unwrap();
        record.transition(TxStatus::Broadcast).unwrap();
        record.transition(TxStatus::Pending).unwrap();
        record.push_attempt(AttemptKind::Original, H256::repeat_byte(0xaa), request());
        record.warnings.push("possibly incomplete".into());

        let raw = serde_json::to_string(&record).unwrap();
        let restored: TransactionRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn cancellation_is_zero_value_self_transfer() {
        let cancel = request().cancellation(GasPrice::Legacy(U256::from(130u64)));
        assert_eq!(cancel.to, cancel.from);
        assert_eq!(cancel.value, U256::zero());
        assert_eq!(cancel.nonce, 5);
        assert_eq!(cancel.gas_limit, U256::from(TRANSFER_GAS));
    }
}
