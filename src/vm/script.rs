//! Script and contract code objects: the deployable units the interpreter
//! executes. Wire layout is `fields ‖ methods`, each vector length-prefixed,
//! each method `is_public ‖ is_payable ‖ locals_type ‖ return_type ‖ instrs`.

use ethereum_types::H256;

use crate::common::codec::{self, CodecError, Reader};
use crate::common::crypto::blake2b256;
use crate::vm::instr::Instr;
use crate::vm::value::Type;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub is_public: bool,
    pub is_payable: bool,
    pub locals_type: Vec<Type>,
    pub return_type: Vec<Type>,
    pub instrs: Vec<Instr>,
}

impl Method {
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        codec::encode_bool(self.is_public, buf);
        codec::encode_bool(self.is_payable, buf);
        encode_types(&self.locals_type, buf);
        encode_types(&self.return_type, buf);
        codec::encode_len(self.instrs.len(), buf);
        for instr in &self.instrs {
            instr.encode_to(buf)?;
        }
        Ok(())
    }

    pub fn decode_from(r: &mut Reader, stateful: bool) -> Result<Self, CodecError> {
        let is_public = codec::decode_bool(r)?;
        let is_payable = codec::decode_bool(r)?;
        let locals_type = decode_types(r)?;
        let return_type = decode_types(r)?;
        let n = codec::decode_len(r)?;
        let mut instrs = Vec::with_capacity(n);
        for _ in 0..n {
            instrs.push(if stateful {
                Instr::decode_stateful(r)?
            } else {
                Instr::decode_stateless(r)?
            });
        }
        Ok(Method {
            is_public,
            is_payable,
            locals_type,
            return_type,
            instrs,
        })
    }

    /// Byte offset of every instruction start, plus the total code width.
    /// Jump targets must land on one of these offsets.
    pub fn instr_offsets(&self) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(self.instrs.len());
        let mut pos = 0;
        for instr in &self.instrs {
            offsets.push(pos);
            pos += instr.encoded_len();
        }
        (offsets, pos)
    }
}

fn encode_types(types: &[Type], buf: &mut Vec<u8>) {
    codec::encode_len(types.len(), buf);
    for ty in types {
        buf.push(ty.id());
    }
}

fn decode_types(r: &mut Reader) -> Result<Vec<Type>, CodecError> {
    let n = codec::decode_len(r)?;
    let mut types = Vec::with_capacity(n);
    for _ in 0..n {
        let id = r.read_byte()?;
        types.push(Type::from_id(id).ok_or(CodecError::InvalidTag(id))?);
    }
    Ok(types)
}

fn encode_code(fields: &[Type], methods: &[Method]) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![];
    encode_types(fields, &mut buf);
    codec::encode_len(methods.len(), &mut buf);
    for method in methods {
        method.encode_to(&mut buf)?;
    }
    Ok(buf)
}

fn decode_code(bytes: &[u8], stateful: bool) -> Result<(Vec<Type>, Vec<Method>), CodecError> {
    let mut r = Reader::new(bytes);
    let fields = decode_types(&mut r)?;
    let n = codec::decode_len(&mut r)?;
    let mut methods = Vec::with_capacity(n);
    for _ in 0..n {
        methods.push(Method::decode_from(&mut r, stateful)?);
    }
    r.finish()?;
    Ok((fields, methods))
}

/// Code restricted to the stateless instruction table, used to validate
/// spends (P2SH) outside any world state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessScript {
    pub fields: Vec<Type>,
    pub methods: Vec<Method>,
}

impl StatelessScript {
    pub fn serialization(&self) -> Result<Vec<u8>, CodecError> {
        encode_code(&self.fields, &self.methods)
    }

    pub fn deserialization(bytes: &[u8]) -> Result<Self, CodecError> {
        let (fields, methods) = decode_code(bytes, false)?;
        Ok(Self { fields, methods })
    }
}

/// One-shot code carried by a transaction; may use the full instruction set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulScript {
    pub fields: Vec<Type>,
    pub methods: Vec<Method>,
}

impl StatefulScript {
    pub fn serialization(&self) -> Result<Vec<u8>, CodecError> {
        encode_code(&self.fields, &self.methods)
    }

    pub fn deserialization(bytes: &[u8]) -> Result<Self, CodecError> {
        let (fields, methods) = decode_code(bytes, true)?;
        Ok(Self { fields, methods })
    }
}

/// Deployed code, addressed by contract id and persisted in the world state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulContract {
    pub fields: Vec<Type>,
    pub methods: Vec<Method>,
}

impl StatefulContract {
    pub fn serialization(&self) -> Result<Vec<u8>, CodecError> {
        encode_code(&self.fields, &self.methods)
    }

    pub fn deserialization(bytes: &[u8]) -> Result<Self, CodecError> {
        let (fields, methods) = decode_code(bytes, true)?;
        Ok(Self { fields, methods })
    }

    pub fn code_hash(&self) -> Result<H256, CodecError> {
        Ok(blake2b256(&self.serialization()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::instr::opcodes;

    fn sample_method() -> Method {
        Method {
            is_public: true,
            is_payable: false,
            locals_type: vec![Type::U256, Type::Address],
            return_type: vec![Type::U256],
            instrs: vec![
                Instr::LoadLocal(0),
                Instr::U256Const2,
                Instr::U256Add,
                Instr::Return,
            ],
        }
    }

    #[test]
    fn test_contract_roundtrip_is_fixed_point() {
        let contract = StatefulContract {
            fields: vec![Type::U256, Type::ByteVec],
            methods: vec![
                sample_method(),
                Method {
                    is_public: false,
                    is_payable: true,
                    locals_type: vec![],
                    return_type: vec![],
                    instrs: vec![Instr::LoadField(0), Instr::Pop, Instr::Return],
                },
            ],
        };
        let encoded = contract.serialization().unwrap();
        let decoded = StatefulContract::deserialization(&encoded).unwrap();
        assert_eq!(decoded, contract);
        assert_eq!(decoded.serialization().unwrap(), encoded);
    }

    #[test]
    fn test_stateless_script_rejects_stateful_code() {
        let contract = StatefulContract {
            fields: vec![],
            methods: vec![Method {
                is_public: true,
                is_payable: false,
                locals_type: vec![],
                return_type: vec![],
                instrs: vec![Instr::LoadField(0), Instr::Return],
            }],
        };
        let encoded = contract.serialization().unwrap();
        assert_eq!(
            StatelessScript::deserialization(&encoded),
            Err(CodecError::InvalidOpcode(opcodes::LOAD_FIELD))
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let script = StatelessScript {
            fields: vec![],
            methods: vec![],
        };
        let mut encoded = script.serialization().unwrap();
        encoded.push(0);
        assert_eq!(
            StatelessScript::deserialization(&encoded),
            Err(CodecError::TrailingBytes)
        );
    }

    #[test]
    fn test_instr_offsets() {
        let method = sample_method();
        let (offsets, total) = method.instr_offsets();
        // LoadLocal is 2 bytes, U256Const2 and U256Add and Return 1 byte each
        assert_eq!(offsets, vec![0, 2, 3, 4]);
        assert_eq!(total, 5);
    }

    #[test]
    fn test_wire_fixture() {
        // fields [], one public non-payable method returning U256 with body
        // [U256Const2, U256Const3, U256Add, Return]
        let script = StatelessScript {
            fields: vec![],
            methods: vec![Method {
                is_public: true,
                is_payable: false,
                locals_type: vec![],
                return_type: vec![Type::U256],
                instrs: vec![
                    Instr::U256Const2,
                    Instr::U256Const3,
                    Instr::U256Add,
                    Instr::Return,
                ],
            }],
        };
        let expected = hex::decode("00010100000102040e0f2902").unwrap();
        assert_eq!(script.serialization().unwrap(), expected);
        assert_eq!(StatelessScript::deserialization(&expected).unwrap(), script);
    }

    #[test]
    fn test_code_hash_is_stable() {
        let contract = StatefulContract {
            fields: vec![],
            methods: vec![sample_method()],
        };
        assert_eq!(
            contract.code_hash().unwrap(),
            blake2b256(&contract.serialization().unwrap())
        );
    }
}
