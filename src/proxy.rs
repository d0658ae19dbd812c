use std::collections::BTreeMap;

use crate::abi::{self, Token, Translator};
use crate::account::Address;
use crate::harness::{self, Harness, TxOptions};

/// Decoded return payload of a contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Returned {
    Single(Token),
    Tuple(Vec<Token>),
}

impl Returned {
    pub fn into_tokens(self) -> Vec<Token> {
        match self {
            Returned::Single(token) => vec![token],
            Returned::Tuple(tokens) => tokens,
        }
    }
}

/// A deployed contract's functions, looked up by name at call time and routed
/// through the harness's transaction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractProxy {
    address: Address,
    methods: BTreeMap<String, abi::Function>,
}

impl ContractProxy {
    pub fn new(translator: &Translator, address: Address) -> Self {
        let methods = translator.functions()
            .map(|f| (f.name.clone(), f.clone()))
            .collect();
        Self { address, methods }
    }

    pub fn from_json(json: &str, address: Address) -> Result<Self, abi::Error> {
        Ok(Self::new(&Translator::from_json(json)?, address))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn method(&self, name: &str) -> Result<&abi::Function, abi::Error> {
        self.methods.get(name).ok_or_else(|| abi::Error::UnknownFunction(name.to_string()))
    }

    pub fn call(
        &self,
        chain: &mut Harness,
        name: &str,
        args: &[Token],
        opts: TxOptions<'_>,
    ) -> Result<Option<Returned>, harness::Error> {
        let method = self.method(name)?;
        let data = method.encode_input(args)?;
        let output = match chain.transact(Some(self.address), data, opts)? {
            Some(output) => output,
            None => return Ok(None),
        };
        let mut tokens = method.decode_output(&output)?;
        if tokens.len() == 1 {
            return Ok(tokens.pop().map(Returned::Single));
        }
        Ok(Some(Returned::Tuple(tokens)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethnum::U256;
    use crate::compiler::{self, Asm};
    use crate::harness::Deployed;
    use crate::txn;

    fn deploy(h: &mut Harness, start: u64) -> ContractProxy {
        h.compilers_mut().register("asm", Asm);
        let deployed = h.deploy_contract(
            compiler::tests::COUNTER.as_bytes(),
            &[Token::uint(start)],
            "asm",
            TxOptions::default(),
        ).unwrap();
        match deployed {
            Deployed::Proxy(proxy) => proxy,
            Deployed::Address(_) => panic!("asm deployment should give a proxy"),
        }
    }

    #[test]
    fn return_shapes() {
        let mut h = Harness::default();
        let counter = deploy(&mut h, 5);
        assert_eq!(counter.methods().collect::<Vec<_>>(), vec!["add", "get", "noop", "pair"]);
        assert_eq!(counter.call(&mut h, "get", &[], TxOptions::default()), Ok(Some(Returned::Single(Token::uint(5)))));
        assert_eq!(counter.call(&mut h, "add", &[Token::uint(3)], TxOptions::default()), Ok(Some(Returned::Single(Token::uint(8)))));
        assert_eq!(
            counter.call(&mut h, "pair", &[], TxOptions::default()),
            Ok(Some(Returned::Tuple(vec![Token::uint(8), Token::uint(9)]))),
        );
        assert_eq!(counter.call(&mut h, "noop", &[], TxOptions::default()), Ok(None));
        assert_eq!(h.storage_at(&counter.address(), U256::ZERO), U256::new(8));

        let single = counter.call(&mut h, "get", &[], TxOptions::default()).unwrap().unwrap();
        assert_eq!(single.into_tokens(), vec![Token::uint(8)]);
        let pair = counter.call(&mut h, "pair", &[], TxOptions::default()).unwrap().unwrap();
        let words: Vec<Option<U256>> = pair.into_tokens().iter().map(Token::as_uint).collect();
        assert_eq!(words, vec![Some(U256::new(8)), Some(U256::new(9))]);
        assert_eq!(Token::Bool(true).as_uint(), None);
    }

    #[test]
    fn call_errors() {
        let mut h = Harness::default();
        let counter = deploy(&mut h, 0);
        let count = h.block().transactions.len();
        assert_eq!(
            counter.call(&mut h, "missing", &[], TxOptions::default()),
            Err(harness::Error::Abi(abi::Error::UnknownFunction(String::from("missing")))),
        );
        assert_eq!(
            counter.call(&mut h, "add", &[Token::Bool(true)], TxOptions::default()),
            Err(harness::Error::Abi(abi::Error::TypeMismatch(abi::ParamType::Uint(256)))),
        );
        // configuration errors never reach the chain
        assert_eq!(h.block().transactions.len(), count);

        let fixture = h.fixture();
        let poor = TxOptions { value: U256::new(u128::MAX), ..TxOptions::sender(fixture.key(3)) };
        assert_eq!(
            counter.call(&mut h, "get", &[], poor),
            Err(harness::Error::Rejected(txn::Error::InsuffBal)),
        );
        assert_eq!(h.block().transactions.len(), count + 1);
    }

    #[test]
    fn from_interface_json() {
        let mut h = Harness::default();
        let counter = deploy(&mut h, 11);
        let json = r#"[{ "type": "function", "name": "get", "outputs": [{ "type": "uint256" }] }]"#;
        let view = ContractProxy::from_json(json, counter.address()).unwrap();
        assert_eq!(view.call(&mut h, "get", &[], TxOptions::default()), Ok(Some(Returned::Single(Token::uint(11)))));
        assert!(view.method("add").is_err());
    }
}
