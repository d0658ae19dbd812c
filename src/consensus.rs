use std::fmt::Debug;
use std::rc::Rc;

use ethnum::U256;
use log::trace;

use crate::account::Address;
use crate::block::{Block, Chain, Header};
use crate::config::{Config, Consensus, Env};
use crate::state::State;

/// Block production rules: how a block is laid out on top of the tip and what
/// happens to the state once its transactions have run.
pub trait Strategy: Debug {
    fn config(&self) -> &Config;

    fn difficulty(&self, parent: &Header, timestamp: u64) -> u64;

    fn reward(&self) -> U256;

    fn block_setup(&self, chain: &Chain, timestamp: u64, coinbase: Address) -> Block {
        let head = chain.head();
        let parent = &head.block.header;
        let header = Header {
            prev_hash: head.block_hash,
            number: parent.number + 1,
            timestamp,
            coinbase,
            difficulty: self.difficulty(parent, timestamp),
            gas_limit: parent.gas_limit,
            ..Header::default()
        };
        Block { header, transactions: Vec::new() }
    }

    /// Pay the coinbase its reward plus the fees collected in `state.env`.
    fn finalize(&self, state: &mut State, header: &Header) {
        let payout = self.reward().saturating_add(state.env.fees);
        trace!("block {}: paying {} to {}", header.number, payout, hex::encode(header.coinbase));
        state.credit(&header.coinbase, payout);
        state.env.fees = U256::ZERO;
    }

    /// Finalize and commit the resulting roots into the header, leaving only the
    /// nonce to be found.
    fn pre_seal(&self, state: &mut State, block: &mut Block) {
        self.finalize(state, &block.header);
        block.header.gas_used = state.env.gas_used;
        block.header.state_root = state.commit();
        block.header.txns_root = block.txns_root();
    }
}

/// Frontier difficulty adjustment and a fixed block reward.
#[derive(Debug, Clone)]
pub struct Pow {
    config: Config,
}

impl Pow {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Strategy for Pow {
    fn config(&self) -> &Config {
        &self.config
    }

    fn difficulty(&self, parent: &Header, timestamp: u64) -> u64 {
        let offset = parent.difficulty / self.config.difficulty_bound_divisor.max(1);
        let next = if timestamp.saturating_sub(parent.timestamp) < self.config.difficulty_cutoff {
            parent.difficulty.saturating_add(offset)
        } else {
            parent.difficulty.saturating_sub(offset)
        };
        next.max(self.config.min_difficulty)
    }

    fn reward(&self) -> U256 {
        U256::from(self.config.block_reward)
    }
}

/// Constant difficulty, fees only.
#[derive(Debug, Clone)]
pub struct Fixed {
    config: Config,
}

impl Fixed {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Strategy for Fixed {
    fn config(&self) -> &Config {
        &self.config
    }

    fn difficulty(&self, _parent: &Header, _timestamp: u64) -> u64 {
        self.config.genesis_difficulty
    }

    fn reward(&self) -> U256 {
        U256::ZERO
    }
}

pub fn select(env: &Env) -> Rc<dyn Strategy> {
    match env.config.consensus {
        Consensus::Pow => Rc::new(Pow::new(env.config.clone())),
        Consensus::Fixed => Rc::new(Fixed::new(env.config.clone())),
    }
}
