use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ethnum::{I256, U256};
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use thiserror::Error;

use crate::account::Address;
use crate::vm;

pub type Selector = [u8; 4];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no function named `{0}`")]
    UnknownFunction(String),
    #[error("unsupported type `{0}`")]
    BadType(String),
    #[error("expected {expected} arguments, got {got}")]
    ArgCount { expected: usize, got: usize },
    #[error("value does not match type `{0}`")]
    TypeMismatch(ParamType),
    #[error("value out of range for type `{0}`")]
    OutOfRange(ParamType),
    #[error("data too short to decode")]
    ShortData,
    #[error("string is not utf-8")]
    Utf8,
    #[error("bad interface: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Uint(usize),
    Int(usize),
    Bool,
    Address,
    FixedBytes(usize),
    Bytes,
    String,
}

impl ParamType {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ParamType::Bytes | ParamType::String)
    }
}

fn bit_width(s: &str, whole: &str) -> Result<usize, Error> {
    if s.is_empty() {
        return Ok(256);
    }
    match s.parse::<usize>() {
        Ok(n) if n > 0 && n <= 256 && n % 8 == 0 => Ok(n),
        _ => Err(Error::BadType(whole.to_string())),
    }
}

impl FromStr for ParamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let t = s.trim();
        match t {
            "bool" => return Ok(ParamType::Bool),
            "address" => return Ok(ParamType::Address),
            "bytes" => return Ok(ParamType::Bytes),
            "string" => return Ok(ParamType::String),
            _ => {}
        }
        if let Some(n) = t.strip_prefix("uint") {
            return bit_width(n, t).map(ParamType::Uint);
        }
        if let Some(n) = t.strip_prefix("int") {
            return bit_width(n, t).map(ParamType::Int);
        }
        if let Some(n) = t.strip_prefix("bytes") {
            return match n.parse::<usize>() {
                Ok(n) if (1..=32).contains(&n) => Ok(ParamType::FixedBytes(n)),
                _ => Err(Error::BadType(t.to_string())),
            };
        }
        Err(Error::BadType(t.to_string()))
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Uint(n) => write!(f, "uint{}", n),
            ParamType::Int(n) => write!(f, "int{}", n),
            ParamType::Bool => write!(f, "bool"),
            ParamType::Address => write!(f, "address"),
            ParamType::FixedBytes(n) => write!(f, "bytes{}", n),
            ParamType::Bytes => write!(f, "bytes"),
            ParamType::String => write!(f, "string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(U256),
    Int(I256),
    Bool(bool),
    Address(Address),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    String(String),
}

impl Token {
    pub fn uint(v: u64) -> Self {
        Token::Uint(U256::from(v))
    }

    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Token::Uint(v) => Some(*v),
            _ => None,
        }
    }
}

pub fn signature(name: &str, types: &[ParamType]) -> String {
    let types: Vec<String> = types.iter().map(ParamType::to_string).collect();
    format!("{}({})", name, types.join(","))
}

pub fn selector(signature: &str) -> Selector {
    let digest = Sha256::digest(signature.as_bytes());
    let mut sel = [0u8; 4];
    sel.copy_from_slice(&digest[..4]);
    sel
}

fn padded_len(len: usize) -> usize {
    (len + 31) / 32 * 32
}

fn encode_word(ty: &ParamType, token: &Token) -> Result<[u8; 32], Error> {
    let mismatch = || Error::TypeMismatch(ty.clone());
    let mut word = [0u8; 32];
    match (ty, token) {
        (ParamType::Uint(bits), Token::Uint(v)) => {
            if *bits < 256 && (*v >> *bits as u32) != U256::ZERO {
                return Err(Error::OutOfRange(ty.clone()));
            }
            word = v.to_be_bytes();
        }
        (ParamType::Int(bits), Token::Int(v)) => {
            if *bits < 256 {
                let bound = I256::ONE << (*bits as u32 - 1);
                if *v < -bound || *v >= bound {
                    return Err(Error::OutOfRange(ty.clone()));
                }
            }
            word = v.to_be_bytes();
        }
        (ParamType::Bool, Token::Bool(b)) => word[31] = *b as u8,
        (ParamType::Address, Token::Address(a)) => word[12..].copy_from_slice(a),
        (ParamType::FixedBytes(n), Token::FixedBytes(b)) => {
            if b.len() != *n {
                return Err(Error::OutOfRange(ty.clone()));
            }
            word[..*n].copy_from_slice(b);
        }
        _ => return Err(mismatch()),
    }
    Ok(word)
}

fn encode_tail(ty: &ParamType, token: &Token) -> Result<Vec<u8>, Error> {
    let bytes = match (ty, token) {
        (ParamType::Bytes, Token::Bytes(b)) => b.as_slice(),
        (ParamType::String, Token::String(s)) => s.as_bytes(),
        _ => return Err(Error::TypeMismatch(ty.clone())),
    };
    let mut out = U256::from(bytes.len() as u64).to_be_bytes().to_vec();
    out.extend_from_slice(bytes);
    out.resize(32 + padded_len(bytes.len()), 0);
    Ok(out)
}

/// Head/tail encoding of `tokens` as a tuple of `types`.
pub fn encode(types: &[ParamType], tokens: &[Token]) -> Result<Vec<u8>, Error> {
    if types.len() != tokens.len() {
        return Err(Error::ArgCount { expected: types.len(), got: tokens.len() });
    }
    let mut head = Vec::with_capacity(32 * types.len());
    let mut tail = Vec::new();
    for (ty, token) in types.iter().zip(tokens) {
        if ty.is_dynamic() {
            let offset = 32 * types.len() + tail.len();
            head.extend_from_slice(&U256::from(offset as u64).to_be_bytes());
            tail.extend(encode_tail(ty, token)?);
        } else {
            head.extend_from_slice(&encode_word(ty, token)?);
        }
    }
    head.extend(tail);
    Ok(head)
}

fn word_at(data: &[u8], offset: usize) -> Result<[u8; 32], Error> {
    let end = offset.checked_add(32).ok_or(Error::ShortData)?;
    let slice = data.get(offset..end).ok_or(Error::ShortData)?;
    let mut word = [0u8; 32];
    word.copy_from_slice(slice);
    Ok(word)
}

fn decode_word(ty: &ParamType, word: [u8; 32]) -> Token {
    match ty {
        ParamType::Uint(_) => Token::Uint(U256::from_be_bytes(word)),
        ParamType::Int(_) => Token::Int(I256::from_be_bytes(word)),
        ParamType::Bool => Token::Bool(word.iter().any(|b| *b != 0)),
        ParamType::Address => {
            let mut addr = [0u8; 20];
            addr.copy_from_slice(&word[12..]);
            Token::Address(addr)
        }
        ParamType::FixedBytes(n) => Token::FixedBytes(word[..*n].to_vec()),
        // dynamic types are decoded from the tail
        ParamType::Bytes | ParamType::String => unreachable!(),
    }
}

pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::with_capacity(types.len());
    for (i, ty) in types.iter().enumerate() {
        let head = word_at(data, 32 * i)?;
        if !ty.is_dynamic() {
            tokens.push(decode_word(ty, head));
            continue;
        }
        let offset = vm::to_usize(U256::from_be_bytes(head)).ok_or(Error::ShortData)?;
        let len = vm::to_usize(U256::from_be_bytes(word_at(data, offset)?)).ok_or(Error::ShortData)?;
        let start = offset + 32;
        let bytes = start.checked_add(len)
            .and_then(|end| data.get(start..end))
            .ok_or(Error::ShortData)?
            .to_vec();
        tokens.push(match ty {
            ParamType::String => Token::String(String::from_utf8(bytes).map_err(|_| Error::Utf8)?),
            _ => Token::Bytes(bytes),
        });
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Param {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Param {
    pub fn new(kind: &str) -> Self {
        Self { name: String::new(), kind: kind.to_string() }
    }
}

/// One entry of a JSON interface description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entry {
    Function {
        name: String,
        #[serde(default)]
        inputs: Vec<Param>,
        #[serde(default)]
        outputs: Vec<Param>,
    },
    Constructor {
        #[serde(default)]
        inputs: Vec<Param>,
    },
    // events, fallback and the like carry nothing callable
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub selector: Selector,
    pub inputs: Vec<ParamType>,
    pub outputs: Vec<ParamType>,
}

impl Function {
    pub fn encode_input(&self, args: &[Token]) -> Result<Vec<u8>, Error> {
        let mut data = self.selector.to_vec();
        data.extend(encode(&self.inputs, args)?);
        Ok(data)
    }

    pub fn decode_output(&self, data: &[u8]) -> Result<Vec<Token>, Error> {
        decode(&self.outputs, data)
    }
}

fn parse_params(params: &[Param]) -> Result<Vec<ParamType>, Error> {
    params.iter().map(|p| p.kind.parse()).collect()
}

/// Encoder and decoder for one contract interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translator {
    functions: BTreeMap<String, Function>,
    constructor: Vec<ParamType>,
}

impl Translator {
    /// A later function with the same name replaces an earlier one.
    pub fn new(entries: &[Entry]) -> Result<Self, Error> {
        let mut translator = Translator::default();
        for entry in entries {
            match entry {
                Entry::Function { name, inputs, outputs } => {
                    let inputs = parse_params(inputs)?;
                    let outputs = parse_params(outputs)?;
                    let selector = selector(&signature(name, &inputs));
                    translator.functions.insert(name.clone(), Function { name: name.clone(), selector, inputs, outputs });
                }
                Entry::Constructor { inputs } => translator.constructor = parse_params(inputs)?,
                Entry::Other => {}
            }
        }
        Ok(translator)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let entries: Vec<Entry> = serde_json::from_str(json).map_err(|e| Error::Json(e.to_string()))?;
        Self::new(&entries)
    }

    pub fn function(&self, name: &str) -> Result<&Function, Error> {
        self.functions.get(name).ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn encode(&self, name: &str, args: &[Token]) -> Result<Vec<u8>, Error> {
        self.function(name)?.encode_input(args)
    }

    pub fn decode(&self, name: &str, data: &[u8]) -> Result<Vec<Token>, Error> {
        self.function(name)?.decode_output(data)
    }

    pub fn encode_constructor_arguments(&self, args: &[Token]) -> Result<Vec<u8>, Error> {
        encode(&self.constructor, args)
    }
}
