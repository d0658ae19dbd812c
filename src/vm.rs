use std::collections::{HashMap, HashSet};

use ethnum::U256;
use thiserror::Error;

use crate::account::Address;

pub const STACK_LIMIT: usize = 1024;

pub mod op {
    pub const STOP: u8 = 0x00;
    pub const ADD: u8 = 0x01;
    pub const MUL: u8 = 0x02;
    pub const SUB: u8 = 0x03;
    pub const DIV: u8 = 0x04;
    pub const MOD: u8 = 0x06;
    pub const LT: u8 = 0x10;
    pub const GT: u8 = 0x11;
    pub const EQ: u8 = 0x14;
    pub const ISZERO: u8 = 0x15;
    pub const AND: u8 = 0x16;
    pub const OR: u8 = 0x17;
    pub const XOR: u8 = 0x18;
    pub const NOT: u8 = 0x19;
    pub const SHL: u8 = 0x1b;
    pub const SHR: u8 = 0x1c;
    pub const ADDRESS: u8 = 0x30;
    pub const BALANCE: u8 = 0x31;
    pub const CALLER: u8 = 0x33;
    pub const CALLVALUE: u8 = 0x34;
    pub const CALLDATALOAD: u8 = 0x35;
    pub const CALLDATASIZE: u8 = 0x36;
    pub const CODESIZE: u8 = 0x38;
    pub const CODELOAD: u8 = 0x3c;
    pub const TIMESTAMP: u8 = 0x42;
    pub const NUMBER: u8 = 0x43;
    pub const POP: u8 = 0x50;
    pub const SLOAD: u8 = 0x54;
    pub const SSTORE: u8 = 0x55;
    pub const JUMP: u8 = 0x56;
    pub const JUMPI: u8 = 0x57;
    pub const JUMPDEST: u8 = 0x5b;
    pub const PUSH1: u8 = 0x60;
    pub const PUSH4: u8 = 0x63;
    pub const PUSH32: u8 = 0x7f;
    pub const DUP1: u8 = 0x80;
    pub const DUP16: u8 = 0x8f;
    pub const SWAP1: u8 = 0x90;
    pub const SWAP16: u8 = 0x9f;
    pub const RETURN: u8 = 0xf3;
    pub const RETURNCODE: u8 = 0xf4;
    pub const REVERT: u8 = 0xfd;
}

const NAMES: [(&str, u8); 37] = [
    ("stop", op::STOP), ("add", op::ADD), ("mul", op::MUL), ("sub", op::SUB),
    ("div", op::DIV), ("mod", op::MOD), ("lt", op::LT), ("gt", op::GT),
    ("eq", op::EQ), ("iszero", op::ISZERO), ("and", op::AND), ("or", op::OR),
    ("xor", op::XOR), ("not", op::NOT), ("shl", op::SHL), ("shr", op::SHR),
    ("address", op::ADDRESS), ("balance", op::BALANCE), ("caller", op::CALLER),
    ("callvalue", op::CALLVALUE), ("calldataload", op::CALLDATALOAD),
    ("calldatasize", op::CALLDATASIZE), ("codesize", op::CODESIZE),
    ("codeload", op::CODELOAD), ("timestamp", op::TIMESTAMP), ("number", op::NUMBER),
    ("pop", op::POP), ("sload", op::SLOAD), ("sstore", op::SSTORE),
    ("jump", op::JUMP), ("jumpi", op::JUMPI), ("jumpdest", op::JUMPDEST),
    ("return", op::RETURN), ("returncode", op::RETURNCODE), ("revert", op::REVERT),
    // aliases
    ("halt", op::STOP), ("dest", op::JUMPDEST),
];

/// Opcode for a mnemonic, including `dupN` and `swapN`. Pushes are assembled separately.
pub fn mnemonic(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if let Some(n) = name.strip_prefix("dup").and_then(|n| n.parse::<u8>().ok()) {
        return (1..=16).contains(&n).then(|| op::DUP1 + n - 1);
    }
    if let Some(n) = name.strip_prefix("swap").and_then(|n| n.parse::<u8>().ok()) {
        return (1..=16).contains(&n).then(|| op::SWAP1 + n - 1);
    }
    NAMES.iter().find(|(m, _)| *m == name).map(|(_, code)| *code)
}

fn gas_cost(opcode: u8) -> u64 {
    match opcode {
        op::STOP | op::RETURN | op::RETURNCODE | op::REVERT => 0,
        op::JUMPDEST => 1,
        op::ADDRESS | op::CALLER | op::CALLVALUE | op::CALLDATASIZE | op::CODESIZE
        | op::TIMESTAMP | op::NUMBER | op::POP => 2,
        op::MUL | op::DIV | op::MOD => 5,
        op::JUMP => 8,
        op::JUMPI => 10,
        op::SLOAD => 200,
        op::BALANCE => 400,
        // charged by value in `execute`
        op::SSTORE => 0,
        _ => 3,
    }
}

pub const SSTORE_SET_GAS: u64 = 20_000;
pub const SSTORE_RESET_GAS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("out of gas")]
    OutOfGas,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("bad jump destination {0}")]
    BadJump(U256),
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("code range out of bounds")]
    CodeBounds,
    #[error("execution reverted")]
    Reverted,
}

/// What the machine may read and write outside its own stack.
pub trait Host {
    fn balance(&self, addr: &Address) -> U256;
    fn sload(&self, addr: &Address, key: U256) -> U256;
    fn sstore(&mut self, addr: &Address, key: U256, value: U256);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub address: Address,
    pub caller: Address,
    pub value: U256,
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub output: Vec<u8>,
    pub gas_left: u64,
}

pub fn word_of_address(addr: &Address) -> U256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(addr);
    U256::from_be_bytes(bytes)
}

pub fn address_of_word(word: U256) -> Address {
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&word.to_be_bytes()[12..]);
    addr
}

pub fn to_usize(word: U256) -> Option<usize> {
    let bytes = word.to_be_bytes();
    if bytes[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[24..]);
    usize::try_from(u64::from_be_bytes(low)).ok()
}

fn flag(b: bool) -> U256 {
    if b { U256::ONE } else { U256::ZERO }
}

// 32 bytes at `offset`, zero padded past the end.
fn load_word(data: &[u8], offset: U256) -> U256 {
    let mut bytes = [0u8; 32];
    if let Some(start) = to_usize(offset) {
        for (i, b) in bytes.iter_mut().enumerate() {
            match start.checked_add(i).and_then(|at| data.get(at)) {
                Some(v) => *b = *v,
                None => break,
            }
        }
    }
    U256::from_be_bytes(bytes)
}

fn shift_amount(word: U256) -> Option<u32> {
    to_usize(word).filter(|s| *s < 256).map(|s| s as u32)
}

pub fn jumpdests(code: &[u8]) -> HashSet<usize> {
    let mut dests = HashSet::new();
    let mut pc = 0;
    while pc < code.len() {
        let opcode = code[pc];
        if opcode == op::JUMPDEST {
            dests.insert(pc);
        }
        pc += 1;
        if (op::PUSH1..=op::PUSH32).contains(&opcode) {
            pc += (opcode - op::PUSH1 + 1) as usize;
        }
    }
    dests
}

struct Stack(Vec<U256>);

impl Stack {
    fn pop(&mut self) -> Result<U256, Error> {
        self.0.pop().ok_or(Error::StackUnderflow)
    }

    fn push(&mut self, word: U256) -> Result<(), Error> {
        if self.0.len() == STACK_LIMIT {
            return Err(Error::StackOverflow);
        }
        self.0.push(word);
        Ok(())
    }

    fn binary(&mut self, f: impl Fn(U256, U256) -> U256) -> Result<(), Error> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.push(f(a, b))
    }
}

/// Run `code` to completion. Running off the end of the code is a STOP.
pub fn execute<H: Host>(
    host: &mut H,
    ctx: &Context,
    code: &[u8],
    calldata: &[u8],
    gas: u64,
) -> Result<Outcome, Error> {
    let dests = jumpdests(code);
    let mut stack = Stack(Vec::with_capacity(32));
    let mut gas_left = gas;
    let mut pc = 0usize;
    loop {
        let opcode = match code.get(pc) {
            Some(opcode) => *opcode,
            None => return Ok(Outcome { output: Vec::new(), gas_left }),
        };
        gas_left = gas_left.checked_sub(gas_cost(opcode)).ok_or(Error::OutOfGas)?;
        pc += 1;
        match opcode {
            op::STOP => return Ok(Outcome { output: Vec::new(), gas_left }),
            op::ADD => stack.binary(|a, b| a.wrapping_add(b))?,
            op::MUL => stack.binary(|a, b| a.wrapping_mul(b))?,
            op::SUB => stack.binary(|a, b| a.wrapping_sub(b))?,
            op::DIV => stack.binary(|a, b| if b == U256::ZERO { U256::ZERO } else { a / b })?,
            op::MOD => stack.binary(|a, b| if b == U256::ZERO { U256::ZERO } else { a % b })?,
            op::LT => stack.binary(|a, b| flag(a < b))?,
            op::GT => stack.binary(|a, b| flag(a > b))?,
            op::EQ => stack.binary(|a, b| flag(a == b))?,
            op::AND => stack.binary(|a, b| a & b)?,
            op::OR => stack.binary(|a, b| a | b)?,
            op::XOR => stack.binary(|a, b| a ^ b)?,
            op::SHL => stack.binary(|shift, v| shift_amount(shift).map_or(U256::ZERO, |s| v << s))?,
            op::SHR => stack.binary(|shift, v| shift_amount(shift).map_or(U256::ZERO, |s| v >> s))?,
            op::ISZERO => {
                let a = stack.pop()?;
                stack.push(flag(a == U256::ZERO))?;
            }
            op::NOT => {
                let a = stack.pop()?;
                stack.push(!a)?;
            }
            op::ADDRESS => stack.push(word_of_address(&ctx.address))?,
            op::BALANCE => {
                let addr = address_of_word(stack.pop()?);
                stack.push(host.balance(&addr))?;
            }
            op::CALLER => stack.push(word_of_address(&ctx.caller))?,
            op::CALLVALUE => stack.push(ctx.value)?,
            op::CALLDATALOAD => {
                let offset = stack.pop()?;
                stack.push(load_word(calldata, offset))?;
            }
            op::CALLDATASIZE => stack.push(U256::from(calldata.len() as u64))?,
            op::CODESIZE => stack.push(U256::from(code.len() as u64))?,
            op::CODELOAD => {
                let offset = stack.pop()?;
                stack.push(load_word(code, offset))?;
            }
            op::TIMESTAMP => stack.push(U256::from(ctx.timestamp))?,
            op::NUMBER => stack.push(U256::from(ctx.number))?,
            op::POP => {
                stack.pop()?;
            }
            op::SLOAD => {
                let key = stack.pop()?;
                stack.push(host.sload(&ctx.address, key))?;
            }
            op::SSTORE => {
                let key = stack.pop()?;
                let value = stack.pop()?;
                let cost = if host.sload(&ctx.address, key) == U256::ZERO && value != U256::ZERO {
                    SSTORE_SET_GAS
                } else {
                    SSTORE_RESET_GAS
                };
                gas_left = gas_left.checked_sub(cost).ok_or(Error::OutOfGas)?;
                host.sstore(&ctx.address, key, value);
            }
            op::JUMP => {
                let dest = stack.pop()?;
                pc = to_usize(dest).filter(|d| dests.contains(d)).ok_or(Error::BadJump(dest))?;
            }
            op::JUMPI => {
                let dest = stack.pop()?;
                let cond = stack.pop()?;
                if cond != U256::ZERO {
                    pc = to_usize(dest).filter(|d| dests.contains(d)).ok_or(Error::BadJump(dest))?;
                }
            }
            op::JUMPDEST => {}
            op::PUSH1..=op::PUSH32 => {
                let n = (opcode - op::PUSH1 + 1) as usize;
                let mut bytes = [0u8; 32];
                for i in 0..n {
                    bytes[32 - n + i] = code.get(pc + i).copied().unwrap_or(0);
                }
                stack.push(U256::from_be_bytes(bytes))?;
                pc += n;
            }
            op::DUP1..=op::DUP16 => {
                let n = (opcode - op::DUP1 + 1) as usize;
                let len = stack.0.len();
                if n > len {
                    return Err(Error::StackUnderflow);
                }
                stack.push(stack.0[len - n])?;
            }
            op::SWAP1..=op::SWAP16 => {
                let n = (opcode - op::SWAP1 + 1) as usize;
                let len = stack.0.len();
                if n >= len {
                    return Err(Error::StackUnderflow);
                }
                stack.0.swap(len - 1, len - 1 - n);
            }
            op::RETURN => {
                let count = to_usize(stack.pop()?).ok_or(Error::StackUnderflow)?;
                if count > stack.0.len() {
                    return Err(Error::StackUnderflow);
                }
                let words = stack.0.split_off(stack.0.len() - count);
                let output = words.iter().flat_map(|w| w.to_be_bytes()).collect();
                return Ok(Outcome { output, gas_left });
            }
            op::RETURNCODE => {
                let offset = to_usize(stack.pop()?).ok_or(Error::CodeBounds)?;
                let len = to_usize(stack.pop()?).ok_or(Error::CodeBounds)?;
                let end = offset.checked_add(len).filter(|end| *end <= code.len()).ok_or(Error::CodeBounds)?;
                return Ok(Outcome { output: code[offset..end].to_vec(), gas_left });
            }
            op::REVERT => return Err(Error::Reverted),
            other => return Err(Error::InvalidOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("label `{0}` defined twice")]
    DuplicateLabel(String),
    #[error("label `{0}` is never defined")]
    UndefinedLabel(String),
}

/// Bytecode builder. Label references assemble to fixed-width PUSH4s so offsets
/// are known before the label is.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    pub fn push(&mut self, value: U256) -> &mut Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(31);
        self.code.push(op::PUSH1 + (31 - skip) as u8);
        self.code.extend_from_slice(&bytes[skip..]);
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.push(U256::from(value))
    }

    pub fn push_label(&mut self, name: &str) -> &mut Self {
        self.code.push(op::PUSH4);
        self.fixups.push((self.code.len(), name.to_string()));
        self.code.extend_from_slice(&[0u8; 4]);
        self
    }

    /// Jump target: records the offset and emits a JUMPDEST.
    pub fn label(&mut self, name: &str) -> Result<&mut Self, AsmError> {
        self.mark(name)?;
        Ok(self.op(op::JUMPDEST))
    }

    /// Records the current offset without emitting anything.
    pub fn mark(&mut self, name: &str) -> Result<&mut Self, AsmError> {
        if self.labels.insert(name.to_string(), self.code.len()).is_some() {
            return Err(AsmError::DuplicateLabel(name.to_string()));
        }
        Ok(self)
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn assemble(mut self) -> Result<Vec<u8>, AsmError> {
        for (at, name) in &self.fixups {
            let offset = *self.labels.get(name).ok_or_else(|| AsmError::UndefinedLabel(name.clone()))?;
            self.code[*at..*at + 4].copy_from_slice(&(offset as u32).to_be_bytes());
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Mem {
        storage: BTreeMap<(Address, U256), U256>,
    }

    impl Host for Mem {
        fn balance(&self, _addr: &Address) -> U256 {
            U256::new(77)
        }

        fn sload(&self, addr: &Address, key: U256) -> U256 {
            self.storage.get(&(*addr, key)).copied().unwrap_or(U256::ZERO)
        }

        fn sstore(&mut self, addr: &Address, key: U256, value: U256) {
            self.storage.insert((*addr, key), value);
        }
    }

    fn ctx() -> Context {
        Context { address: [7u8; 20], caller: [9u8; 20], value: U256::new(5), number: 3, timestamp: 42 }
    }

    fn run(code: &[u8], calldata: &[u8]) -> Result<Outcome, Error> {
        execute(&mut Mem::default(), &ctx(), code, calldata, 1_000_000)
    }

    fn words(out: &Outcome) -> Vec<U256> {
        out.output.chunks(32).map(|c| U256::from_be_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn arithmetic_operand_order() {
        let mut asm = Assembler::new();
        // 10 - 3, operands pushed in reverse
        asm.push_u64(3).push_u64(10).op(op::SUB);
        asm.push_u64(4).push_u64(20).op(op::DIV);
        asm.push_u64(0).push_u64(1).op(op::DIV);
        asm.push_u64(2).push_u64(1).op(op::LT);
        asm.push_u64(4).op(op::RETURN);
        let out = run(&asm.assemble().unwrap(), &[]).unwrap();
        assert_eq!(words(&out), vec![U256::new(7), U256::new(5), U256::ZERO, U256::ONE]);
    }

    #[test]
    fn environment() {
        let mut asm = Assembler::new();
        asm.op(op::CALLER).op(op::CALLVALUE).op(op::NUMBER).op(op::TIMESTAMP);
        asm.push_u64(0).op(op::CALLDATALOAD).op(op::CALLDATASIZE);
        asm.push_u64(6).op(op::RETURN);
        let mut calldata = [0u8; 33];
        calldata[31] = 0xaa;
        let out = run(&asm.assemble().unwrap(), &calldata).unwrap();
        assert_eq!(words(&out), vec![
            word_of_address(&[9u8; 20]),
            U256::new(5),
            U256::new(3),
            U256::new(42),
            U256::new(0xaa),
            U256::new(33),
        ]);
    }

    #[test]
    fn calldata_is_zero_padded() {
        let mut asm = Assembler::new();
        asm.push_u64(1).op(op::CALLDATALOAD).push_u64(1).op(op::RETURN);
        let out = run(&asm.assemble().unwrap(), &[0x11, 0x22]).unwrap();
        let mut expected = [0u8; 32];
        expected[0] = 0x22;
        assert_eq!(out.output, expected.to_vec());
    }

    #[test]
    fn storage_and_gas() {
        let mut asm = Assembler::new();
        asm.push_u64(99).push_u64(1).op(op::SSTORE);
        asm.push_u64(1).op(op::SLOAD).push_u64(1).op(op::RETURN);
        let code = asm.assemble().unwrap();
        let mut mem = Mem::default();
        let out = execute(&mut mem, &ctx(), &code, &[], 100_000).unwrap();
        assert_eq!(words(&out), vec![U256::new(99)]);
        assert_eq!(mem.sload(&[7u8; 20], U256::new(1)), U256::new(99));
        // 4 pushes, one sstore on a fresh slot, one sload
        assert_eq!(100_000 - out.gas_left, 4 * 3 + SSTORE_SET_GAS + 200);

        assert_eq!(execute(&mut Mem::default(), &ctx(), &code, &[], 10_000), Err(Error::OutOfGas));
    }

    #[test]
    fn jumps() {
        let mut asm = Assembler::new();
        asm.push_u64(1).push_label("skip").op(op::JUMPI);
        asm.op(op::REVERT);
        asm.label("skip").unwrap();
        asm.push_u64(8).push_u64(1).op(op::RETURN);
        let out = run(&asm.assemble().unwrap(), &[]).unwrap();
        assert_eq!(words(&out), vec![U256::new(8)]);

        // jump into push data is rejected
        let code = [op::PUSH1, op::JUMPDEST, op::PUSH1, 0x01, op::JUMP];
        assert_eq!(run(&code, &[]), Err(Error::BadJump(U256::ONE)));
    }

    #[test]
    fn failures() {
        assert_eq!(run(&[op::ADD], &[]), Err(Error::StackUnderflow));
        assert_eq!(run(&[op::REVERT], &[]), Err(Error::Reverted));
        assert_eq!(run(&[0xee], &[]), Err(Error::InvalidOpcode(0xee)));
        assert_eq!(run(&[], &[]), Ok(Outcome { output: Vec::new(), gas_left: 1_000_000 }));
        let overflow: Vec<u8> = [op::PUSH1, 0].repeat(STACK_LIMIT + 1);
        assert_eq!(run(&overflow, &[]), Err(Error::StackOverflow));
    }

    #[test]
    fn returncode() {
        let mut asm = Assembler::new();
        asm.push_u64(2).push_label("tail").op(op::RETURNCODE);
        asm.mark("tail").unwrap();
        asm.raw(&[0xab, 0xcd, 0xef]);
        let out = run(&asm.assemble().unwrap(), &[]).unwrap();
        assert_eq!(out.output, vec![0xab, 0xcd]);
    }

    #[test]
    fn assembler_labels() {
        let mut asm = Assembler::new();
        asm.push_label("nowhere");
        assert_eq!(asm.assemble(), Err(AsmError::UndefinedLabel(String::from("nowhere"))));
        let mut asm = Assembler::new();
        asm.mark("a").unwrap();
        assert!(matches!(asm.mark("a"), Err(AsmError::DuplicateLabel(_))));
    }

    #[test]
    fn mnemonics() {
        assert_eq!(mnemonic("SSTORE"), Some(op::SSTORE));
        assert_eq!(mnemonic("dup3"), Some(op::DUP1 + 2));
        assert_eq!(mnemonic("swap16"), Some(op::SWAP16));
        assert_eq!(mnemonic("dup17"), None);
        assert_eq!(mnemonic("frobnicate"), None);
    }
}
