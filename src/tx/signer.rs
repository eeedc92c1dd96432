//! Signing seam: the engine never holds key material itself

use super::record::TransactionRequest;
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: H256,
}

/// Produces a network-valid signature for a request from `address()`
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, request: &TransactionRequest) -> EngineResult<SignedTransaction>;
}

/// In-process key held by an ethers `LocalWallet`
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the private key from the environment variable `var`
    pub fn from_env(var: &str) -> EngineResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            EngineError::Signer(format!("No wallet configured. Set {} to a private key", var))
        })?;
        let wallet = key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| EngineError::Signer(format!("Invalid private key: {}", e)))?;

        info!("Loaded signer {:?}", wallet.address());
        Ok(Self::new(wallet))
    }
}

#[async_trait]
impl TransactionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, request: &TransactionRequest) -> EngineResult<SignedTransaction> {
        if request.from != self.wallet.address() {
            return Err(EngineError::Signer(format!(
                "request from {:?} cannot be signed by {:?}",
                request.from,
                self.wallet.address()
            )));
        }

        let tx = request.to_typed();
        let wallet = self.wallet.clone().with_chain_id(request.chain_id);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| EngineError::Signer(e.to_string()))?;

        let raw = tx.rlp_signed(&signature);
        Ok(SignedTransaction {
            hash: H256::from(keccak256(&raw)),
            raw,
        })
    }
}

/// Signers by account, with the primary used when an intent names no sender
#[derive(Clone)]
pub struct Signers {
    primary: Address,
    by_address: HashMap<Address, Arc<dyn TransactionSigner>>,
}

impl Signers {
    pub fn new(primary: Arc<dyn TransactionSigner>) -> Self {
        let address = primary.address();
        let mut by_address = HashMap::new();
        by_address.insert(address, primary);
        Self {
            primary: address,
            by_address,
        }
    }

    pub fn with(mut self, signer: Arc<dyn TransactionSigner>) -> Self {
        self.by_address.insert(signer.address(), signer);
        self
    }

    pub fn primary(&self) -> Address {
        self.primary
    }

    pub fn get(&self, account: &Address) -> EngineResult<Arc<dyn TransactionSigner>> {
        self.by_address
            .get(account)
            .cloned()
            .ok_or_else(|| EngineError::Signer(format!("no signer for {:?}", account)))
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.by_address.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::record::GasPrice;
    use ethers::types::U256;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn request(from: Address, gas_price: GasPrice) -> TransactionRequest {
        TransactionRequest {
            chain_id: 1,
            from,
            to: Address::repeat_byte(0x22),
            value: U256::from(1u64),
            data: Bytes::default(),
            gas_limit: U256::from(21_000u64),
            gas_price,
            nonce: 0,
        }
    }

    #[tokio::test]
    async fn signs_eip1559_as_typed_envelope() {
        let signer = LocalSigner::new(KEY.parse().unwrap());
        let gas = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(30_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        };

        let signed = signer.sign(&request(signer.address(), gas)).await.unwrap();
        assert_eq!(signed.raw[0], 0x02);
        assert_eq!(signed.hash, H256::from(keccak256(&signed.raw)));
    }

    #[tokio::test]
    async fn refuses_foreign_sender() {
        let signer = LocalSigner::new(KEY.parse().unwrap());
        let foreign = request(Address::repeat_byte(0x99), GasPrice::Legacy(U256::one()));
        assert!(matches!(
            signer.sign(&foreign).await,
            Err(EngineError::Signer(_))
        ));
    }

    #[test]
    fn registry_resolves_primary() {
        let signer: Arc<dyn TransactionSigner> = Arc::new(LocalSigner::new(KEY.parse().unwrap()));
        let signers = Signers::new(signer.clone());
        assert_eq!(signers.primary(), signer.address());
        assert!(signers.get(&signer.address()).is_ok());
        assert!(signers.get(&Address::zero()).is_err());
    }
}
