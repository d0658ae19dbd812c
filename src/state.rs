use std::collections::BTreeMap;

use ethnum::U256;
use log::{debug, trace};
use sha2::{Sha256, Digest};

use crate::account::{self, Address, Fixture};
use crate::config::Env;
use crate::merkle::{self, Hash};
use crate::txn::{self, Receipt, Transaction};
use crate::vm;

pub const TEST_ACCOUNT_BALANCE: u128 = 1_000_000_000_000_000_000;
pub const NUM_PRECOMPILES: u64 = 16;

/// Per-block execution context. Not part of the state root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockEnv {
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Fees collected so far in this block, paid to the coinbase at finalization.
    pub fees: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Genesis {
    pub balance: U256,
    pub nonce: u64,
    pub code: Vec<u8>,
    pub storage: BTreeMap<U256, U256>,
}

impl Genesis {
    pub fn funded(balance: U256) -> Self {
        Self { balance, ..Self::default() }
    }
}

pub type Alloc = BTreeMap<Address, Genesis>;

/// The fixture's accounts with a large balance plus the low "precompile" block
/// with a token balance each.
pub fn base_alloc(fixture: &Fixture) -> Alloc {
    let mut alloc = Alloc::new();
    for addr in &fixture.accounts {
        alloc.insert(*addr, Genesis::funded(U256::new(TEST_ACCOUNT_BALANCE)));
    }
    for i in 0..NUM_PRECOMPILES {
        alloc.insert(account::int_to_addr(i), Genesis::funded(U256::ONE));
    }
    alloc
}

pub fn genesis(alloc: &Alloc, env: &Env) -> State {
    let mut state = State::default();
    for (addr, entry) in alloc {
        state.set_account(addr, account::Data {
            balance: entry.balance,
            nonce: entry.nonce,
            code: entry.code.clone(),
        });
        for (key, value) in &entry.storage {
            vm::Host::sstore(&mut state, addr, *key, *value);
        }
    }
    state.env = BlockEnv {
        number: 0,
        timestamp: env.config.genesis_timestamp,
        gas_limit: env.config.block_gas_limit,
        ..BlockEnv::default()
    };
    state
}

pub fn contract_address(sender: &Address, nonce: u64) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(sender);
    hasher.update(nonce.to_be_bytes());
    let digest = hasher.finalize();
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    addr
}

fn storage_key(addr: &Address, key: U256) -> [u8; 52] {
    let mut k = [0u8; 52];
    k[..20].copy_from_slice(addr);
    k[20..].copy_from_slice(&key.to_be_bytes());
    k
}

/// Opaque rollback point for a [`State`]. Shares structure with the state it
/// was taken from.
#[derive(Debug, Clone)]
pub struct Checkpoint(State);

#[derive(Debug, Clone, Default)]
pub struct State {
    pub accounts: merkle::Map<account::Data>,
    pub storage: merkle::Map<[u8; 32]>,
    pub env: BlockEnv,
}

impl State {
    pub fn commit(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.accounts.commit());
        hasher.update(self.storage.commit());
        hasher.finalize().into()
    }

    pub fn ephemeral_clone(&self) -> Self {
        self.clone()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.clone())
    }

    pub fn revert(&mut self, checkpoint: Checkpoint) {
        *self = checkpoint.0;
    }

    /// Reset the execution context for a new block on top of this state.
    pub fn enter_block(&mut self, number: u64, timestamp: u64, gas_limit: u64) {
        self.env = BlockEnv { number, timestamp, gas_limit, ..BlockEnv::default() };
    }

    pub fn account(&self, addr: &Address) -> account::Data {
        self.accounts.get(addr).cloned().unwrap_or_default()
    }

    pub fn set_account(&mut self, addr: &Address, data: account::Data) {
        if data.is_empty() {
            self.accounts.remove(addr);
        } else {
            self.accounts.insert(addr, data);
        }
    }

    pub fn balance(&self, addr: &Address) -> U256 {
        self.accounts.get(addr).map_or(U256::ZERO, |a| a.balance)
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map_or(0, |a| a.nonce)
    }

    pub fn code(&self, addr: &Address) -> Vec<u8> {
        self.accounts.get(addr).map(|a| a.code.clone()).unwrap_or_default()
    }

    pub fn storage_at(&self, addr: &Address, key: U256) -> U256 {
        vm::Host::sload(self, addr, key)
    }

    pub fn credit(&mut self, addr: &Address, amount: U256) {
        let mut data = self.account(addr);
        data.balance = data.balance.saturating_add(amount);
        self.set_account(addr, data);
    }

    fn debit(&mut self, addr: &Address, amount: U256) {
        let mut data = self.account(addr);
        data.balance -= amount;
        self.set_account(addr, data);
    }

    /// Validate and execute one transaction. Validation failures return `Err`
    /// and leave the state untouched. Once validated, the nonce and the gas are
    /// spent whatever the execution outcome, which lands in the receipt.
    pub fn apply(&mut self, stxn: &Transaction) -> Result<Receipt, txn::Error> {
        if !stxn.verify() {
            return Err(txn::Error::BadSig);
        }
        let msg = &stxn.msg;
        let sender = stxn.sender();
        let mut from = self.account(&sender);
        if from.nonce != msg.nonce {
            return Err(txn::Error::BadNonce { expected: from.nonce, got: msg.nonce });
        }
        let next_nonce = from.nonce.checked_add(1).ok_or(txn::Error::NonceOverflow)?;
        let intrinsic = msg.intrinsic_gas();
        if msg.gas_limit < intrinsic {
            return Err(txn::Error::IntrinsicGas(intrinsic));
        }
        if self.env.gas_used.saturating_add(msg.gas_limit) > self.env.gas_limit {
            return Err(txn::Error::BlockGasLimit);
        }
        if from.balance < msg.upfront_cost() {
            return Err(txn::Error::InsuffBal);
        }

        let nonce = from.nonce;
        let price = U256::from(msg.gas_price);
        from.nonce = next_nonce;
        from.balance -= U256::from(msg.gas_limit) * price;
        self.set_account(&sender, from);
        let base = self.checkpoint();

        let gas = msg.gas_limit - intrinsic;
        let result = match msg.to {
            Some(to) => self.call(&sender, &to, msg, gas),
            None => self.create(&sender, nonce, msg, gas),
        };
        let (gas_left, outcome) = match result {
            Ok((output, gas_left)) => (gas_left, Ok(output)),
            Err(e) => {
                self.revert(base);
                (0, Err(e))
            }
        };
        let gas_used = msg.gas_limit - gas_left;
        self.credit(&sender, U256::from(gas_left) * price);
        self.env.gas_used += gas_used;
        self.env.fees = self.env.fees.saturating_add(U256::from(gas_used) * price);
        match &outcome {
            Ok(_) => trace!("applied txn {}#{} ({} gas)", hex::encode(sender), nonce, gas_used),
            Err(e) => debug!("txn {}#{} failed: {}", hex::encode(sender), nonce, e),
        }
        Ok(Receipt { gas_used, outcome })
    }

    fn transfer(&mut self, from: &Address, to: &Address, value: U256) {
        if value != U256::ZERO {
            self.debit(from, value);
            self.credit(to, value);
        }
    }

    fn call(&mut self, sender: &Address, to: &Address, msg: &txn::Txn, gas: u64) -> Result<(Vec<u8>, u64), txn::Error> {
        self.transfer(sender, to, msg.value);
        let code = self.code(to);
        if code.is_empty() {
            return Ok((Vec::new(), gas));
        }
        let ctx = vm::Context {
            address: *to,
            caller: *sender,
            value: msg.value,
            number: self.env.number,
            timestamp: self.env.timestamp,
        };
        let out = vm::execute(self, &ctx, &code, &msg.data, gas)?;
        Ok((out.output, out.gas_left))
    }

    fn create(&mut self, sender: &Address, nonce: u64, msg: &txn::Txn, gas: u64) -> Result<(Vec<u8>, u64), txn::Error> {
        let addr = contract_address(sender, nonce);
        let existing = self.account(&addr);
        if existing.nonce != 0 || !existing.code.is_empty() {
            return Err(txn::Error::CreateCollision);
        }
        self.transfer(sender, &addr, msg.value);
        let ctx = vm::Context {
            address: addr,
            caller: *sender,
            value: msg.value,
            number: self.env.number,
            timestamp: self.env.timestamp,
        };
        let out = vm::execute(self, &ctx, &msg.data, &[], gas)?;
        let deposit = (out.output.len() as u64).saturating_mul(txn::CODE_DEPOSIT_GAS);
        let gas_left = out.gas_left.checked_sub(deposit).ok_or(vm::Error::OutOfGas)?;
        let mut data = self.account(&addr);
        data.code = out.output;
        self.set_account(&addr, data);
        Ok((addr.to_vec(), gas_left))
    }
}

impl vm::Host for State {
    fn balance(&self, addr: &Address) -> U256 {
        State::balance(self, addr)
    }

    fn sload(&self, addr: &Address, key: U256) -> U256 {
        self.storage.get(&storage_key(addr, key))
            .map_or(U256::ZERO, |word| U256::from_be_bytes(*word))
    }

    fn sstore(&mut self, addr: &Address, key: U256, value: U256) {
        let k = storage_key(addr, key);
        if value == U256::ZERO {
            self.storage.remove(&k);
        } else {
            self.storage.insert(&k, value.to_be_bytes());
        }
    }
}
