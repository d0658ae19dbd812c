use std::collections::HashMap;
use std::fmt;

use ethnum::U256;
use thiserror::Error;

use crate::abi::{self, Entry, Param, ParamType};
use crate::vm::{self, op, Assembler};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no compiler registered for `{0}`")]
    UnknownLanguage(String),
    #[error("source is not utf-8")]
    Encoding,
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error(transparent)]
    Abi(#[from] abi::Error),
    #[error(transparent)]
    Asm(#[from] vm::AsmError),
}

/// A source-language backend.
pub trait Compiler {
    /// The interface of the contract `src` defines.
    fn mk_full_signature(&self, src: &str) -> Result<Vec<Entry>, Error>;

    /// Creation bytecode for `src`; constructor arguments get appended to it.
    fn compile(&self, src: &str) -> Result<Vec<u8>, Error>;
}

#[derive(Default)]
pub struct Registry {
    compilers: HashMap<String, Box<dyn Compiler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, language: &str, compiler: impl Compiler + 'static) -> &mut Self {
        self.compilers.insert(language.to_string(), Box::new(compiler));
        self
    }

    pub fn get(&self, language: &str) -> Result<&dyn Compiler, Error> {
        match self.compilers.get(language) {
            Some(compiler) => Ok(compiler.as_ref()),
            None => Err(Error::UnknownLanguage(language.to_string())),
        }
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.compilers.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut languages: Vec<&str> = self.languages().collect();
        languages.sort_unstable();
        f.debug_struct("Registry").field("languages", &languages).finish()
    }
}

const RUNTIME: &str = "__runtime";
const END: &str = "__end";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Push {
    Value(U256),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Instr {
    Label(String),
    Push(Push),
    Op(u8),
    /// Constructor argument word `n`, read from behind the init code.
    Arg(u64),
    /// Call argument word `n`, read after the selector.
    Param(u64),
    /// Jump to the label named after the called function, revert if none matches.
    Dispatch,
}

#[derive(Debug, Default)]
struct Program {
    entries: Vec<Entry>,
    functions: Vec<(String, abi::Selector)>,
    init: Vec<Instr>,
    runtime: Vec<Instr>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Init,
    Runtime,
}

fn syntax(line: usize, msg: impl Into<String>) -> Error {
    Error::Syntax { line, msg: msg.into() }
}

// "(uint256, address)" -> types, keeping the declared spelling for the interface
fn type_list(line: usize, s: &str) -> Result<Vec<String>, Error> {
    let inner = s.trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| syntax(line, "expected a parenthesized type list"))?;
    Ok(inner.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect())
}

fn params(kinds: &[String]) -> Vec<Param> {
    kinds.iter().map(|k| Param::new(k)).collect()
}

fn parse_number(line: usize, s: &str) -> Result<U256, Error> {
    let parsed = match s.strip_prefix("0x") {
        Some(digits) => U256::from_str_radix(digits, 16),
        None => U256::from_str_radix(s, 10),
    };
    parsed.map_err(|_| syntax(line, format!("bad number `{}`", s)))
}

fn parse(src: &str) -> Result<Program, Error> {
    let mut program = Program::default();
    let mut section = Section::Header;
    for (i, raw) in src.lines().enumerate() {
        let line = i + 1;
        let text = raw.split(';').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        if let Some(rest) = text.strip_prefix(".constructor") {
            let kinds = type_list(line, rest)?;
            program.entries.push(Entry::Constructor { inputs: params(&kinds) });
            continue;
        }
        if let Some(rest) = text.strip_prefix(".function") {
            let rest = rest.trim();
            let open = rest.find('(').ok_or_else(|| syntax(line, "expected `(` after function name"))?;
            let name = rest[..open].trim().to_string();
            if name.is_empty() {
                return Err(syntax(line, "missing function name"));
            }
            let (inputs, outputs) = match rest[open..].split_once("->") {
                Some((i, o)) => (type_list(line, i)?, type_list(line, o)?),
                None => (type_list(line, &rest[open..])?, Vec::new()),
            };
            let types = inputs.iter().map(|k| k.parse()).collect::<Result<Vec<ParamType>, _>>()?;
            program.functions.push((name.clone(), abi::selector(&abi::signature(&name, &types))));
            program.entries.push(Entry::Function { name, inputs: params(&inputs), outputs: params(&outputs) });
            continue;
        }
        match text {
            ".init" => {
                section = Section::Init;
                continue;
            }
            ".runtime" => {
                section = Section::Runtime;
                continue;
            }
            _ => {}
        }
        let instrs = match section {
            Section::Header => return Err(syntax(line, "code before `.init` or `.runtime`")),
            Section::Init => &mut program.init,
            Section::Runtime => &mut program.runtime,
        };
        if let Some(label) = text.strip_suffix(':') {
            if label.starts_with("__") {
                return Err(syntax(line, format!("label `{}` is reserved", label)));
            }
            instrs.push(Instr::Label(label.trim().to_string()));
            continue;
        }
        let mut words = text.split_whitespace();
        let mnemonic = words.next().unwrap_or("");
        let operand = words.next();
        if words.next().is_some() {
            return Err(syntax(line, "too many operands"));
        }
        let instr = match (mnemonic, operand) {
            ("push", Some(x)) => match x.strip_prefix('@') {
                Some(label) => Instr::Push(Push::Label(label.to_string())),
                None => Instr::Push(Push::Value(parse_number(line, x)?)),
            },
            ("arg", Some(n)) | ("param", Some(n)) => {
                let n = n.parse::<u64>().map_err(|_| syntax(line, format!("bad index `{}`", n)))?;
                if mnemonic == "arg" { Instr::Arg(n) } else { Instr::Param(n) }
            }
            ("dispatch", None) => Instr::Dispatch,
            (m, None) => Instr::Op(vm::mnemonic(m).ok_or_else(|| syntax(line, format!("unknown op `{}`", m)))?),
            (m, Some(_)) => return Err(syntax(line, format!("`{}` takes no operand", m))),
        };
        instrs.push(instr);
    }
    Ok(program)
}

fn emit(asm: &mut Assembler, instrs: &[Instr], functions: &[(String, abi::Selector)]) -> Result<(), Error> {
    for instr in instrs {
        match instr {
            Instr::Label(name) => {
                asm.label(name)?;
            }
            Instr::Push(Push::Value(v)) => {
                asm.push(*v);
            }
            Instr::Push(Push::Label(name)) => {
                asm.push_label(name);
            }
            Instr::Op(code) => {
                asm.op(*code);
            }
            Instr::Arg(n) => {
                asm.push_u64(32 * n).push_label(END).op(op::ADD).op(op::CODELOAD);
            }
            Instr::Param(n) => {
                asm.push_u64(4 + 32 * n).op(op::CALLDATALOAD);
            }
            Instr::Dispatch => {
                for (name, sel) in functions {
                    asm.push_u64(0).op(op::CALLDATALOAD).push_u64(224).op(op::SHR);
                    asm.push(U256::from(u32::from_be_bytes(*sel))).op(op::EQ);
                    asm.push_label(name).op(op::JUMPI);
                }
                asm.op(op::REVERT);
            }
        }
    }
    Ok(())
}

/// Reference backend: a line-oriented assembly over the VM's opcodes.
///
/// ```text
/// .constructor(uint256)
/// .function get() -> (uint256)
/// .init
///     arg 0
///     push 0
///     sstore
/// .runtime
///     dispatch
/// get:
///     push 0
///     sload
///     push 1
///     return
/// ```
///
/// The init section runs at creation and is followed by a copy of the runtime
/// section, which it returns as the contract's code.
#[derive(Debug, Clone, Copy, Default)]
pub struct Asm;

impl Compiler for Asm {
    fn mk_full_signature(&self, src: &str) -> Result<Vec<Entry>, Error> {
        Ok(parse(src)?.entries)
    }

    fn compile(&self, src: &str) -> Result<Vec<u8>, Error> {
        let program = parse(src)?;
        let mut runtime = Assembler::new();
        emit(&mut runtime, &program.runtime, &program.functions)?;
        let runtime = runtime.assemble()?;

        let mut init = Assembler::new();
        emit(&mut init, &program.init, &program.functions)?;
        init.push_u64(runtime.len() as u64).push_label(RUNTIME).op(op::RETURNCODE);
        init.mark(RUNTIME)?;
        init.raw(&runtime);
        init.mark(END)?;
        Ok(init.assemble()?)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::abi::Translator;

    pub const COUNTER: &str = "
        .constructor(uint256)
        .function get() -> (uint256)
        .function add(uint256) -> (uint256)
        .function pair() -> (uint256, uint256)
        .function noop()
        .init
            arg 0       ; start value
            push 0
            sstore
        .runtime
            dispatch
        get:
            push 0
            sload
            push 1
            return
        add:
            param 0
            push 0
            sload
            add
            dup1
            push 0
            sstore
            push 1
            return
        pair:
            push 0
            sload
            push 0
            sload
            push 1
            add
            push 2
            return
        noop:
            stop
    ";

    #[test]
    fn signature() {
        let entries = Asm.mk_full_signature(COUNTER).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0], Entry::Constructor { inputs: vec![Param::new("uint256")] });
        let t = Translator::new(&entries).unwrap();
        assert_eq!(t.function_names().collect::<Vec<_>>(), vec!["add", "get", "noop", "pair"]);
        assert_eq!(t.function("pair").unwrap().outputs, vec![ParamType::Uint(256), ParamType::Uint(256)]);
        assert!(t.function("noop").unwrap().outputs.is_empty());
    }

    #[test]
    fn layout() {
        let code = Asm.compile(COUNTER).unwrap();
        let runtime = {
            let program = parse(COUNTER).unwrap();
            let mut asm = Assembler::new();
            emit(&mut asm, &program.runtime, &program.functions).unwrap();
            asm.assemble().unwrap()
        };
        assert!(!runtime.is_empty());
        assert!(code.ends_with(&runtime));
        // init returns exactly the trailing runtime copy
        let init = &code[..code.len() - runtime.len()];
        assert_eq!(init.last(), Some(&op::RETURNCODE));
    }

    #[test]
    fn errors() {
        assert!(matches!(Asm.compile("push 1"), Err(Error::Syntax { line: 1, .. })));
        assert!(matches!(Asm.compile(".runtime\n frob"), Err(Error::Syntax { line: 2, .. })));
        assert!(matches!(Asm.compile(".runtime\n push zz"), Err(Error::Syntax { line: 2, .. })));
        assert!(matches!(Asm.compile(".runtime\n push 1 2"), Err(Error::Syntax { .. })));
        assert!(matches!(Asm.compile(".runtime\n __end:"), Err(Error::Syntax { .. })));
        assert_eq!(
            Asm.compile(".runtime\n push @missing\n jump"),
            Err(Error::Asm(vm::AsmError::UndefinedLabel(String::from("missing")))),
        );
        assert_eq!(
            Asm.compile(".function f()\n.runtime\n dispatch"),
            Err(Error::Asm(vm::AsmError::UndefinedLabel(String::from("f")))),
        );
        assert_eq!(
            Asm.mk_full_signature(".function f(float)"),
            Err(Error::Abi(abi::Error::BadType(String::from("float")))),
        );
    }

    #[test]
    fn registry() {
        let mut registry = Registry::new();
        assert_eq!(registry.get("asm").err(), Some(Error::UnknownLanguage(String::from("asm"))));
        registry.register("asm", Asm);
        assert!(registry.get("asm").is_ok());
        assert_eq!(format!("{:?}", registry), "Registry { languages: [\"asm\"] }");
    }
}
