use ethnum::U256;
use serde::{Serialize, Deserialize};
use std::fmt::Debug;
use thiserror::Error;

use crate::{account, merkle, vm};

pub const TX_GAS: u64 = 21_000;
pub const CREATE_GAS: u64 = 53_000;
pub const DATA_ZERO_GAS: u64 = 4;
pub const DATA_NONZERO_GAS: u64 = 16;
pub const CODE_DEPOSIT_GAS: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Txn {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    /// `None` creates a contract.
    pub to: Option<account::Address>,
    pub value: U256,
    pub data: Vec<u8>,
}

impl Txn {
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    pub fn intrinsic_gas(&self) -> u64 {
        let data: u64 = self.data.iter()
            .map(|b| if *b == 0 { DATA_ZERO_GAS } else { DATA_NONZERO_GAS })
            .sum();
        TX_GAS + data + if self.is_create() { CREATE_GAS } else { 0 }
    }

    /// Gas and value the sender must hold before execution starts.
    pub fn upfront_cost(&self) -> U256 {
        (U256::from(self.gas_limit) * U256::from(self.gas_price)).saturating_add(self.value)
    }
}

pub type Transaction = account::Signed<Txn>;

pub type Seq = merkle::Map<Transaction>;

pub fn seq_root(txns: &[Transaction]) -> merkle::Hash {
    let mut seq = Seq::default();
    for (i, txn) in txns.iter().enumerate() {
        seq.insert(&(i as u64).to_be_bytes(), txn.clone());
    }
    seq.commit()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("bad signature")]
    BadSig,
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("sender nonce cannot be incremented")]
    NonceOverflow,
    #[error("insufficient balance for gas and value")]
    InsuffBal,
    #[error("gas limit below intrinsic gas {0}")]
    IntrinsicGas(u64),
    #[error("block gas limit exceeded")]
    BlockGasLimit,
    #[error("contract address already in use")]
    CreateCollision,
    #[error("execution failed: {0}")]
    Execution(#[from] vm::Error),
}

impl Error {
    /// Rejected before execution: the state was left untouched and no nonce consumed.
    pub fn is_invalid(&self) -> bool {
        !matches!(self, Error::Execution(_) | Error::CreateCollision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub gas_used: u64,
    pub outcome: Result<Vec<u8>, Error>,
}

impl Receipt {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}
