use std::rc::Rc;

use ethnum::U256;
use log::{info, trace};
use digest::Digest;
use serde::{Serialize, Deserialize};
use sha2::Sha256;
use thiserror::Error;

use crate::account::Address;
use crate::config::Env;
use crate::consensus::Strategy;
use crate::merkle::Hash;
use crate::state::State;
use crate::txn::{self, Transaction};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Header {
    pub prev_hash: Hash,
    pub number: u64,
    pub timestamp: u64,
    pub coinbase: Address,
    pub difficulty: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub state_root: Hash,
    pub txns_root: Hash,
    pub nonce: u64,
}

impl Header {
    /// Everything but the nonce.
    pub fn seal_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash);
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.coinbase);
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(self.gas_used.to_be_bytes());
        hasher.update(self.state_root);
        hasher.update(self.txns_root);
        hasher.finalize().into()
    }

    pub fn hash(&self) -> Hash {
        pow_hash(&self.seal_hash(), self.nonce)
    }

    pub fn target(&self) -> U256 {
        U256::MAX / U256::from(self.difficulty.max(1))
    }

    pub fn check_pow(&self) -> bool {
        U256::from_be_bytes(self.hash()) <= self.target()
    }
}

fn pow_hash(seal_hash: &Hash, nonce: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(seal_hash);
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn txns_root(&self) -> Hash {
        txn::seq_root(&self.transactions)
    }
}

/// Bounded nonce search over a block whose header is otherwise final.
#[derive(Debug, Clone)]
pub struct Miner {
    block: Block,
}

impl Miner {
    pub fn new(block: Block) -> Self {
        Self { block }
    }

    pub fn mine(mut self, rounds: u64, start_nonce: u64) -> Option<Block> {
        let seal_hash = self.block.header.seal_hash();
        let target = self.block.header.target();
        for nonce in start_nonce..start_nonce.saturating_add(rounds) {
            if U256::from_be_bytes(pow_hash(&seal_hash, nonce)) <= target {
                trace!("block {} sealed with nonce {}", self.block.header.number, nonce);
                self.block.header.nonce = nonce;
                return Some(self.block);
            }
        }
        trace!("block {}: no seal in nonces {}..+{}", self.block.header.number, start_nonce, rounds);
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("parent hash does not match the tip")]
    BadPrev,
    #[error("block number does not follow the tip")]
    BadNumber,
    #[error("timestamp not after the parent's")]
    BadTimestamp,
    #[error("wrong difficulty")]
    BadDifficulty,
    #[error("proof of work does not meet the target")]
    BadPow,
    #[error("transactions root mismatch")]
    BadTxnseq,
    #[error("gas used mismatch")]
    BadGasUsed,
    #[error("state root mismatch")]
    BadState,
}

#[derive(Debug, Clone)]
pub struct Snap {
    pub block: Block,
    pub block_hash: Hash,
    pub state: State,
}

impl Snap {
    pub fn genesis(state: State, env: &Env) -> Self {
        let header = Header {
            timestamp: env.config.genesis_timestamp,
            difficulty: env.config.genesis_difficulty,
            gas_limit: env.config.block_gas_limit,
            state_root: state.commit(),
            txns_root: txn::seq_root(&[]),
            ..Header::default()
        };
        let block_hash = header.hash();
        Self { block: Block { header, transactions: Vec::new() }, block_hash, state }
    }
}

/// Checks a sealed block against its parent by replaying it.
#[derive(Debug)]
pub struct Verifier<'a> {
    pub head: &'a Snap,
    pub block: Block,
    pub strategy: &'a dyn Strategy,
}

impl<'a> Verifier<'a> {
    pub fn new(head: &'a Snap, block: Block, strategy: &'a dyn Strategy) -> Self {
        Self { head, block, strategy }
    }

    pub fn finalize(self) -> Result<Snap, (Block, Error)> {
        let header = &self.block.header;
        let parent = &self.head.block.header;
        if header.prev_hash != self.head.block_hash {
            return Err((self.block, Error::BadPrev));
        }
        if header.number != parent.number + 1 {
            return Err((self.block, Error::BadNumber));
        }
        if header.timestamp <= parent.timestamp {
            return Err((self.block, Error::BadTimestamp));
        }
        if header.difficulty != self.strategy.difficulty(parent, header.timestamp) {
            return Err((self.block, Error::BadDifficulty));
        }
        if !header.check_pow() {
            return Err((self.block, Error::BadPow));
        }
        if header.txns_root != self.block.txns_root() {
            return Err((self.block, Error::BadTxnseq));
        }
        let mut state = self.head.state.clone();
        state.enter_block(header.number, header.timestamp, header.gas_limit);
        for stxn in &self.block.transactions {
            // rejected transactions stay in the block and replay as no-ops
            let _ = state.apply(stxn);
        }
        self.strategy.finalize(&mut state, header);
        if header.gas_used != state.env.gas_used {
            return Err((self.block, Error::BadGasUsed));
        }
        if header.state_root != state.commit() {
            return Err((self.block, Error::BadState));
        }
        let block_hash = header.hash();
        Ok(Snap { block: self.block, block_hash, state })
    }
}

/// Append-only sequence of verified blocks, each with its post-state.
#[derive(Debug)]
pub struct Chain {
    snaps: Vec<Snap>,
    strategy: Rc<dyn Strategy>,
}

impl Chain {
    pub fn new(genesis: Snap, strategy: Rc<dyn Strategy>) -> Self {
        Self { snaps: vec![genesis], strategy }
    }

    pub fn strategy(&self) -> Rc<dyn Strategy> {
        self.strategy.clone()
    }

    pub fn head(&self) -> &Snap {
        // never empty: starts from genesis and only grows
        &self.snaps[self.snaps.len() - 1]
    }

    pub fn state(&self) -> &State {
        &self.head().state
    }

    /// Number of the tip block.
    pub fn height(&self) -> u64 {
        self.head().block.header.number
    }

    pub fn get(&self, number: u64) -> Option<&Snap> {
        usize::try_from(number).ok().and_then(|i| self.snaps.get(i))
    }

    pub fn snaps(&self) -> &[Snap] {
        &self.snaps
    }

    pub fn add_block(&mut self, block: Block) -> Result<(), Error> {
        let snap = Verifier::new(self.head(), block, self.strategy.as_ref())
            .finalize()
            .map_err(|(_, e)| e)?;
        info!(
            "block {} added: {} txns, {} gas, hash {}",
            snap.block.header.number,
            snap.block.transactions.len(),
            snap.block.header.gas_used,
            hex::encode(snap.block_hash),
        );
        self.snaps.push(snap);
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::account::Fixture;
    use crate::config::{Config, Consensus};
    use crate::consensus;
    use crate::state;
    use crate::txn::Txn;

    fn setup(consensus: Consensus) -> (Fixture, Chain) {
        setup_with(Config { consensus, ..Config::default() })
    }

    fn setup_with(config: Config) -> (Fixture, Chain) {
        let fixture = Fixture::default();
        let env = Env::new(config);
        let genesis = state::genesis(&state::base_alloc(&fixture), &env);
        let chain = Chain::new(Snap::genesis(genesis, &env), consensus::select(&env));
        (fixture, chain)
    }

    // a sealed block paying 10 from key 0 to key 1
    fn build(fixture: &Fixture, chain: &Chain) -> Block {
        let strategy = chain.strategy();
        let timestamp = chain.head().block.header.timestamp + 14;
        let mut block = strategy.block_setup(chain, timestamp, fixture.account(2));
        let mut state = chain.state().ephemeral_clone();
        state.enter_block(block.header.number, block.header.timestamp, block.header.gas_limit);
        let alice = fixture.key(0);
        let stxn = alice.seal(Txn {
            nonce: state.nonce(&alice.address()),
            gas_price: 1,
            gas_limit: 50_000,
            to: Some(fixture.account(1)),
            value: U256::new(10),
            data: Vec::new(),
        });
        state.apply(&stxn).unwrap();
        block.transactions.push(stxn);
        strategy.pre_seal(&mut state, &mut block);
        Miner::new(block).mine(100, 0).unwrap()
    }

    fn check(chain: &Chain, block: Block) -> Result<Snap, Error> {
        let strategy = chain.strategy();
        Verifier::new(chain.head(), block, strategy.as_ref()).finalize().map_err(|(_, e)| e)
    }

    #[test]
    fn ok() {
        let (fixture, mut chain) = setup(Consensus::Pow);
        let block = build(&fixture, &chain);
        assert!(block.header.check_pow());
        assert_eq!(chain.add_block(block), Ok(()));
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.state().balance(&fixture.account(1)), U256::new(state::TEST_ACCOUNT_BALANCE + 10));
        assert_eq!(chain.head().block.header.prev_hash, chain.get(0).unwrap().block_hash);
    }

    #[test]
    fn badprev() {
        let (fixture, chain) = setup(Consensus::Pow);
        let mut block = build(&fixture, &chain);
        block.header.prev_hash = [1u8; 32];
        let block = Miner::new(block).mine(100, 0).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadPrev));
    }

    #[test]
    fn badnumber() {
        let (fixture, chain) = setup(Consensus::Pow);
        let mut block = build(&fixture, &chain);
        block.header.number = 2;
        let block = Miner::new(block).mine(100, 0).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadNumber));
    }

    #[test]
    fn badtimestamp() {
        let (fixture, chain) = setup(Consensus::Fixed);
        let mut block = build(&fixture, &chain);
        block.header.timestamp = chain.head().block.header.timestamp;
        let block = Miner::new(block).mine(100, 0).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadTimestamp));
    }

    #[test]
    fn baddifficulty() {
        let (fixture, chain) = setup(Consensus::Fixed);
        let mut block = build(&fixture, &chain);
        block.header.difficulty = 2;
        let block = Miner::new(block).mine(1_000, 0).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadDifficulty));
    }

    #[test]
    fn badpow() {
        // difficulty 2: about half of all nonces miss the target
        let (fixture, chain) = setup_with(Config {
            consensus: Consensus::Fixed,
            genesis_difficulty: 2,
            ..Config::default()
        });
        let mut block = build(&fixture, &chain);
        let seal = block.header.seal_hash();
        let target = block.header.target();
        block.header.nonce = (0..).find(|n| U256::from_be_bytes(pow_hash(&seal, *n)) > target).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadPow));
    }

    #[test]
    fn badtxnseq() {
        let (fixture, chain) = setup(Consensus::Pow);
        let mut block = build(&fixture, &chain);
        block.transactions.clear();
        assert_eq!(check(&chain, block).err(), Some(Error::BadTxnseq));
    }

    #[test]
    fn badgasused() {
        let (fixture, chain) = setup(Consensus::Pow);
        let mut block = build(&fixture, &chain);
        block.header.gas_used += 1;
        let block = Miner::new(block).mine(100, 0).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadGasUsed));
    }

    #[test]
    fn badstate() {
        let (fixture, chain) = setup(Consensus::Pow);
        let mut block = build(&fixture, &chain);
        block.header.state_root = [0u8; 32];
        let block = Miner::new(block).mine(100, 0).unwrap();
        assert_eq!(check(&chain, block).err(), Some(Error::BadState));
    }

    #[test]
    fn miner_gives_up() {
        let block = Block {
            header: Header { difficulty: u64::MAX, ..Header::default() },
            transactions: Vec::new(),
        };
        assert_eq!(Miner::new(block).mine(10, 0), None);
    }
}
