//! A throwaway proof-of-work chain for exercising contracts: submit transactions
//! against a head state, mine them into blocks, snapshot and roll back.

pub mod abi;
pub mod account;
pub mod block;
pub mod compiler;
pub mod config;
pub mod consensus;
pub mod harness;
pub mod merkle;
pub mod proxy;
pub mod state;
pub mod txn;
pub mod vm;

pub use harness::{Deployed, Harness, Snapshot, TxOptions};
pub use proxy::{ContractProxy, Returned};

/// Default gas limit for harness transactions.
pub const GAS_LIMIT: u64 = 3_141_592;
pub const GAS_PRICE: u64 = 1;
