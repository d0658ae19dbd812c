use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Consensus {
    /// Frontier-style difficulty adjustment plus a block reward.
    #[default]
    Pow,
    /// Constant difficulty, no block reward.
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub consensus: Consensus,
    pub genesis_timestamp: u64,
    pub genesis_difficulty: u64,
    pub min_difficulty: u64,
    pub difficulty_bound_divisor: u64,
    pub difficulty_cutoff: u64,
    pub block_reward: u64,
    pub block_gas_limit: u64,
    /// Seconds between consecutive mined blocks.
    pub block_time: u64,
    /// Proof-of-work attempts per block before giving up.
    pub mine_rounds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consensus: Consensus::Pow,
            genesis_timestamp: 0,
            genesis_difficulty: 1,
            min_difficulty: 1,
            difficulty_bound_divisor: 2048,
            difficulty_cutoff: 13,
            block_reward: 5_000_000_000_000_000_000,
            block_gas_limit: 1_000_000_000,
            block_time: 14,
            mine_rounds: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    pub config: Config,
}

impl Env {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Anything left out of `json` keeps its default.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self { config: serde_json::from_str(json)? })
    }
}
