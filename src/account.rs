use ed25519_dalek::{self, Verifier, Signer};
use ethnum::U256;
use rand::rngs::OsRng;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::fmt::Debug;

pub type Address = [u8; 20];
pub type PublicKey = ed25519_dalek::PublicKey;
pub type Signature = ed25519_dalek::Signature;

pub const NUM_TEST_ACCOUNTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Data {
    pub balance: U256,
    pub nonce: u64,
    pub code: Vec<u8>,
}

impl Data {
    pub fn is_empty(&self) -> bool {
        self.balance == U256::ZERO && self.nonce == 0 && self.code.is_empty()
    }
}

pub fn address_of(pk: &PublicKey) -> Address {
    let digest = Sha256::digest(pk.as_bytes());
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    addr
}

/// Low-numbered addresses, `int_to_addr` style.
pub fn int_to_addr(i: u64) -> Address {
    let mut addr = [0u8; 20];
    addr[12..].copy_from_slice(&i.to_be_bytes());
    addr
}

#[derive(Debug)]
pub struct Keypair {
    pub kp: ed25519_dalek::Keypair
}

impl Keypair {
    pub fn gen() -> Self {
        let mut csprng = OsRng {};
        Self { kp: ed25519_dalek::Keypair::generate(&mut csprng) }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = ed25519_dalek::SecretKey::from_bytes(seed)
            .expect("any 32 bytes are a secret key");
        let public = PublicKey::from(&secret);
        Self { kp: ed25519_dalek::Keypair { secret, public } }
    }

    pub fn public(&self) -> PublicKey {
        self.kp.public
    }

    pub fn address(&self) -> Address {
        address_of(&self.kp.public)
    }

    pub fn sign<T: Serialize>(&self, msg: &T) -> Signature {
        self.kp.sign(serde_json::to_string(msg).expect("can't serialize value").as_bytes())
    }

    pub fn seal<T: Serialize>(&self, msg: T) -> Signed<T> {
        let sig = self.sign(&msg);
        Signed { msg, from: self.kp.public, sig }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signed<T> {
    pub msg: T,
    pub from: PublicKey,
    pub sig: Signature
}

impl<T: Serialize> Signed<T> {
    pub fn verify(&self) -> bool {
        self.from.verify(serde_json::to_string(&self.msg).expect("can't serialize value").as_bytes(), &self.sig).is_ok()
    }

    pub fn sender(&self) -> Address {
        address_of(&self.from)
    }
}

/// The deterministic test identities a harness hands out. Key `i` is seeded by
/// the SHA-256 of the decimal string of `i`.
#[derive(Debug)]
pub struct Fixture {
    pub keys: Vec<Keypair>,
    pub accounts: Vec<Address>,
}

impl Fixture {
    pub fn new(count: usize) -> Self {
        let keys: Vec<Keypair> = (0..count)
            .map(|i| Keypair::from_seed(&Sha256::digest(i.to_string().as_bytes()).into()))
            .collect();
        let accounts = keys.iter().map(Keypair::address).collect();
        Self { keys, accounts }
    }

    pub fn key(&self, i: usize) -> &Keypair {
        &self.keys[i]
    }

    pub fn account(&self, i: usize) -> Address {
        self.accounts[i]
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new(NUM_TEST_ACCOUNTS)
    }
}
