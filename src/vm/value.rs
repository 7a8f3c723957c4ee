use bytes::Bytes;
use ethereum_types::U256;

use crate::common::codec::{self, CodecError, Reader};
use crate::lockup::LockupScript;
use crate::vm::i256::I256;

/// Stack value types. The ids are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    I256,
    U256,
    ByteVec,
    Address,
}

impl Type {
    pub fn id(self) -> u8 {
        match self {
            Type::Bool => 0,
            Type::I256 => 1,
            Type::U256 => 2,
            Type::ByteVec => 3,
            Type::Address => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Type> {
        match id {
            0 => Some(Type::Bool),
            1 => Some(Type::I256),
            2 => Some(Type::U256),
            3 => Some(Type::ByteVec),
            4 => Some(Type::Address),
            _ => None,
        }
    }
}

/// A value on the operand stack or in a storage slot. Values are immutable
/// and compare structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Val {
    Bool(bool),
    I256(I256),
    U256(U256),
    ByteVec(Bytes),
    Address(LockupScript),
}

impl Val {
    pub fn type_of(&self) -> Type {
        match self {
            Val::Bool(_) => Type::Bool,
            Val::I256(_) => Type::I256,
            Val::U256(_) => Type::U256,
            Val::ByteVec(_) => Type::ByteVec,
            Val::Address(_) => Type::Address,
        }
    }

    /// The zero value of a type, used to initialize fresh fields and locals.
    pub fn default_of(ty: Type) -> Val {
        match ty {
            Type::Bool => Val::Bool(false),
            Type::I256 => Val::I256(I256::zero()),
            Type::U256 => Val::U256(U256::zero()),
            Type::ByteVec => Val::ByteVec(Bytes::new()),
            Type::Address => Val::Address(LockupScript::P2pkh(Default::default())),
        }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.type_of().id());
        match self {
            Val::Bool(v) => codec::encode_bool(*v, buf),
            Val::I256(v) => codec::encode_i256(v, buf),
            Val::U256(v) => codec::encode_u256(v, buf),
            Val::ByteVec(v) => codec::encode_bytes(v, buf),
            Val::Address(v) => v.encode_to(buf),
        }
    }

    pub fn decode_from(r: &mut Reader) -> Result<Val, CodecError> {
        let tag = r.read_byte()?;
        let ty = Type::from_id(tag).ok_or(CodecError::InvalidTag(tag))?;
        Ok(match ty {
            Type::Bool => Val::Bool(codec::decode_bool(r)?),
            Type::I256 => Val::I256(codec::decode_i256(r)?),
            Type::U256 => Val::U256(codec::decode_u256(r)?),
            Type::ByteVec => Val::ByteVec(codec::decode_bytes(r)?),
            Type::Address => Val::Address(LockupScript::decode_from(r)?),
        })
    }

    /// Decode a length-prefixed vector of values, consuming the whole buffer.
    pub fn decode_vec(bytes: &[u8]) -> Result<Vec<Val>, CodecError> {
        let mut r = Reader::new(bytes);
        let n = codec::decode_len(&mut r)?;
        let mut vals = Vec::with_capacity(n);
        for _ in 0..n {
            vals.push(Val::decode_from(&mut r)?);
        }
        r.finish()?;
        Ok(vals)
    }

    pub fn encode_vec(vals: &[Val]) -> Vec<u8> {
        let mut buf = vec![];
        codec::encode_len(vals.len(), &mut buf);
        for val in vals {
            val.encode_to(&mut buf);
        }
        buf
    }
}
