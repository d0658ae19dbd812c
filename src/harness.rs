use std::rc::Rc;

use ethnum::U256;
use log::{debug, info, warn};
use thiserror::Error;

use crate::abi::{self, Token, Translator};
use crate::account::{Address, Fixture, Keypair};
use crate::block::{Block, Chain, Miner, Snap};
use crate::compiler::{self, Registry};
use crate::config::Env;
use crate::consensus::{self, Strategy};
use crate::proxy::ContractProxy;
use crate::state::{self, Alloc, Checkpoint, State};
use crate::txn::{self, Transaction, Txn};
use crate::{GAS_LIMIT, GAS_PRICE};

/// Language name for raw bytecode deployments.
pub const EVM: &str = "evm";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("transaction failed: {0}")]
    Rejected(#[from] txn::Error),
    #[error(transparent)]
    Abi(#[from] abi::Error),
    #[error(transparent)]
    Compiler(#[from] compiler::Error),
    #[error("raw bytecode deployments take no constructor arguments")]
    ConstructorArgs,
    #[error("no proof of work found for block {number} in {rounds} rounds")]
    Exhausted { number: u64, rounds: u64 },
}

/// Per-call transaction parameters. Without a sender, fixture key 0 signs.
#[derive(Debug, Clone, Copy)]
pub struct TxOptions<'k> {
    pub sender: Option<&'k Keypair>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u64,
}

impl<'k> Default for TxOptions<'k> {
    fn default() -> Self {
        Self { sender: None, value: U256::ZERO, gas_limit: GAS_LIMIT, gas_price: GAS_PRICE }
    }
}

impl<'k> TxOptions<'k> {
    pub fn sender(key: &'k Keypair) -> Self {
        Self { sender: Some(key), ..Self::default() }
    }
}

#[derive(Debug, Clone)]
pub enum Deployed {
    Address(Address),
    Proxy(ContractProxy),
}

impl Deployed {
    pub fn address(&self) -> Address {
        match self {
            Deployed::Address(address) => *address,
            Deployed::Proxy(proxy) => proxy.address(),
        }
    }
}

/// Rollback point for the head state. Only valid while the pending block it was
/// taken in is still pending.
#[derive(Debug, Clone)]
pub struct Snapshot {
    checkpoint: Checkpoint,
    txcount: usize,
    number: u64,
}

impl Snapshot {
    pub fn txcount(&self) -> usize {
        self.txcount
    }

    pub fn number(&self) -> u64 {
        self.number
    }
}

/// A private single-node chain: a verified chain of sealed blocks, a pending
/// block, and a head state that every submitted transaction runs against
/// immediately.
#[derive(Debug)]
pub struct Harness {
    fixture: Rc<Fixture>,
    env: Env,
    strategy: Rc<dyn Strategy>,
    chain: Chain,
    block: Block,
    head_state: State,
    compilers: Registry,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(Fixture::default(), None, None)
    }
}

fn head_for(chain: &Chain, block: &Block) -> State {
    let mut state = chain.state().ephemeral_clone();
    state.enter_block(block.header.number, block.header.timestamp, block.header.gas_limit);
    state
}

impl Harness {
    /// Without `alloc`, the fixture accounts and the low addresses are funded.
    pub fn new(fixture: Fixture, alloc: Option<Alloc>, env: Option<Env>) -> Self {
        let env = env.unwrap_or_default();
        let alloc = alloc.unwrap_or_else(|| state::base_alloc(&fixture));
        let genesis = state::genesis(&alloc, &env);
        let strategy = consensus::select(&env);
        let chain = Chain::new(Snap::genesis(genesis, &env), strategy.clone());
        let timestamp = chain.head().block.header.timestamp + 1;
        let block = strategy.block_setup(&chain, timestamp, Address::default());
        let head_state = head_for(&chain, &block);
        info!(
            "genesis {} with {} accounts, {:?} consensus",
            hex::encode(chain.head().block_hash),
            alloc.len(),
            env.config.consensus,
        );
        Self {
            fixture: Rc::new(fixture),
            env,
            strategy,
            chain,
            block,
            head_state,
            compilers: Registry::new(),
        }
    }

    pub fn fixture(&self) -> Rc<Fixture> {
        self.fixture.clone()
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// The pending block.
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn head_state(&self) -> &State {
        &self.head_state
    }

    pub fn last_tx(&self) -> Option<&Transaction> {
        self.block.transactions.last()
    }

    pub fn compilers(&self) -> &Registry {
        &self.compilers
    }

    pub fn compilers_mut(&mut self) -> &mut Registry {
        &mut self.compilers
    }

    pub fn balance(&self, addr: &Address) -> U256 {
        self.head_state.balance(addr)
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.head_state.nonce(addr)
    }

    pub fn code(&self, addr: &Address) -> Vec<u8> {
        self.head_state.code(addr)
    }

    pub fn storage_at(&self, addr: &Address, key: U256) -> U256 {
        self.head_state.storage_at(addr, key)
    }

    /// Sign a transaction at the sender's head nonce, run it on the head state
    /// and append it to the pending block whatever the outcome.
    ///
    /// A transaction rejected during validation (bad nonce, intrinsic gas, balance,
    /// block gas limit) is still recorded, but it does not consume the sender's
    /// nonce: the head state is left untouched and block replay skips it.
    pub fn tx(
        &mut self,
        sender: &Keypair,
        to: Option<Address>,
        value: U256,
        data: Vec<u8>,
        gas_limit: u64,
        gas_price: u64,
    ) -> Result<Option<Vec<u8>>, txn::Error> {
        let from = sender.address();
        let stxn = sender.seal(Txn {
            nonce: self.head_state.nonce(&from),
            gas_price,
            gas_limit,
            to,
            value,
            data,
        });
        let result = self.head_state.apply(&stxn);
        self.block.transactions.push(stxn);
        match result.and_then(|receipt| receipt.outcome) {
            Ok(output) => Ok(if output.is_empty() { None } else { Some(output) }),
            Err(e) => {
                if e.is_invalid() {
                    debug!("txn from {} rejected: {}", hex::encode(from), e);
                } else {
                    debug!("txn from {} failed, gas spent: {}", hex::encode(from), e);
                }
                Err(e)
            }
        }
    }

    pub fn transact(&mut self, to: Option<Address>, data: Vec<u8>, opts: TxOptions<'_>) -> Result<Option<Vec<u8>>, txn::Error> {
        let fixture = self.fixture.clone();
        let sender = opts.sender.unwrap_or_else(|| fixture.key(0));
        self.tx(sender, to, opts.value, data, opts.gas_limit, opts.gas_price)
    }

    /// Raw bytecode under [`EVM`], otherwise source for a registered compiler,
    /// in which case the result is a proxy for the new contract.
    pub fn deploy_contract(
        &mut self,
        code: &[u8],
        args: &[Token],
        language: &str,
        opts: TxOptions<'_>,
    ) -> Result<Deployed, Error> {
        if language == EVM {
            if !args.is_empty() {
                return Err(Error::ConstructorArgs);
            }
            return self.create(code.to_vec(), opts).map(Deployed::Address);
        }
        let (translator, data) = {
            let compiler = self.compilers.get(language)?;
            let src = std::str::from_utf8(code).map_err(|_| compiler::Error::Encoding)?;
            let translator = Translator::new(&compiler.mk_full_signature(src)?)?;
            let mut data = compiler.compile(src)?;
            if !args.is_empty() {
                data.extend(translator.encode_constructor_arguments(args)?);
            }
            (translator, data)
        };
        let address = self.create(data, opts)?;
        Ok(Deployed::Proxy(ContractProxy::new(&translator, address)))
    }

    fn create(&mut self, data: Vec<u8>, opts: TxOptions<'_>) -> Result<Address, Error> {
        let fixture = self.fixture.clone();
        let sender = opts.sender.unwrap_or_else(|| fixture.key(0));
        let address = state::contract_address(&sender.address(), self.head_state.nonce(&sender.address()));
        self.tx(sender, None, opts.value, data, opts.gas_limit, opts.gas_price)?;
        info!("contract created at {}", hex::encode(address));
        Ok(address)
    }

    /// Seal the pending block, then `number_of_blocks - 1` empty ones, and
    /// start a fresh pending block on the new tip. At least one block is mined.
    pub fn mine(&mut self, number_of_blocks: u64, coinbase: Address) -> Result<(), Error> {
        let strategy = self.strategy.clone();
        let rounds = self.env.config.mine_rounds;
        let unsealed = self.block.clone();
        let checkpoint = self.head_state.checkpoint();

        self.block.header.coinbase = coinbase;
        strategy.pre_seal(&mut self.head_state, &mut self.block);
        let sealed = match Miner::new(self.block.clone()).mine(rounds, 0) {
            Some(sealed) => sealed,
            None => {
                warn!("gave up sealing block {} after {} rounds", unsealed.header.number, rounds);
                self.block = unsealed;
                self.head_state.revert(checkpoint);
                return Err(Error::Exhausted { number: self.block.header.number, rounds });
            }
        };
        if let Err(e) = self.chain.add_block(sealed) {
            panic!("chain rejected mined block {}: {}", self.block.header.number, e);
        }
        assert_eq!(
            self.head_state.commit(),
            self.chain.state().commit(),
            "head state diverged from the chain tip",
        );

        let mut result = Ok(());
        for _ in 1..number_of_blocks {
            let timestamp = self.chain.head().block.header.timestamp + self.env.config.block_time;
            let mut block = strategy.block_setup(&self.chain, timestamp, coinbase);
            let mut state = head_for(&self.chain, &block);
            strategy.pre_seal(&mut state, &mut block);
            let number = block.header.number;
            let sealed = match Miner::new(block).mine(rounds, 0) {
                Some(sealed) => sealed,
                None => {
                    warn!("gave up sealing block {} after {} rounds", number, rounds);
                    result = Err(Error::Exhausted { number, rounds });
                    break;
                }
            };
            if let Err(e) = self.chain.add_block(sealed) {
                panic!("chain rejected mined block {}: {}", number, e);
            }
        }

        let timestamp = self.chain.head().block.header.timestamp + self.env.config.block_time;
        self.block = strategy.block_setup(&self.chain, timestamp, Address::default());
        self.head_state = head_for(&self.chain, &self.block);
        result
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            checkpoint: self.head_state.checkpoint(),
            txcount: self.block.transactions.len(),
            number: self.block.header.number,
        }
    }

    /// Panics if a block was mined since `snapshot` was taken.
    pub fn revert(&mut self, snapshot: Snapshot) {
        assert_eq!(
            snapshot.number, self.block.header.number,
            "snapshot taken in a block that has since been mined",
        );
        self.block.transactions.truncate(snapshot.txcount);
        self.head_state.revert(snapshot.checkpoint);
    }
}
