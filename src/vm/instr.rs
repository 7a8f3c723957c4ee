//! The instruction set and its codec. Opcode assignments are consensus
//! critical: stateless instructions sit at 0..=76, stateful-only ones at
//! 160..=180, and `CallExternal` keeps code 1 but only decodes in stateful
//! code.

use bytes::Bytes;
use ethereum_types::U256;
use once_cell::sync::Lazy;

use crate::common::codec::{self, CodecError, Reader};
use crate::common::constants::{gas, MAX_JUMP_OFFSET};
use crate::lockup::LockupScript;
use crate::vm::i256::I256;

pub mod opcodes {
    pub const CALL_LOCAL: u8 = 0;
    pub const CALL_EXTERNAL: u8 = 1;
    pub const RETURN: u8 = 2;

    pub const CONST_TRUE: u8 = 3;
    pub const CONST_FALSE: u8 = 4;
    pub const I256_CONST_0: u8 = 5;
    pub const I256_CONST_1: u8 = 6;
    pub const I256_CONST_2: u8 = 7;
    pub const I256_CONST_3: u8 = 8;
    pub const I256_CONST_4: u8 = 9;
    pub const I256_CONST_5: u8 = 10;
    pub const I256_CONST_N1: u8 = 11;
    pub const U256_CONST_0: u8 = 12;
    pub const U256_CONST_1: u8 = 13;
    pub const U256_CONST_2: u8 = 14;
    pub const U256_CONST_3: u8 = 15;
    pub const U256_CONST_4: u8 = 16;
    pub const U256_CONST_5: u8 = 17;
    pub const I256_CONST: u8 = 18;
    pub const U256_CONST: u8 = 19;
    pub const BYTES_CONST: u8 = 20;
    pub const ADDRESS_CONST: u8 = 21;

    pub const LOAD_LOCAL: u8 = 22;
    pub const STORE_LOCAL: u8 = 23;
    pub const POP: u8 = 24;

    pub const NOT_BOOL: u8 = 25;
    pub const AND_BOOL: u8 = 26;
    pub const OR_BOOL: u8 = 27;
    pub const EQ_BOOL: u8 = 28;
    pub const NE_BOOL: u8 = 29;

    pub const I256_ADD: u8 = 30;
    pub const I256_SUB: u8 = 31;
    pub const I256_MUL: u8 = 32;
    pub const I256_DIV: u8 = 33;
    pub const I256_MOD: u8 = 34;
    pub const EQ_I256: u8 = 35;
    pub const NE_I256: u8 = 36;
    pub const LT_I256: u8 = 37;
    pub const LE_I256: u8 = 38;
    pub const GT_I256: u8 = 39;
    pub const GE_I256: u8 = 40;

    pub const U256_ADD: u8 = 41;
    pub const U256_SUB: u8 = 42;
    pub const U256_MUL: u8 = 43;
    pub const U256_DIV: u8 = 44;
    pub const U256_MOD: u8 = 45;
    pub const U256_MOD_ADD: u8 = 46;
    pub const U256_MOD_SUB: u8 = 47;
    pub const U256_MOD_MUL: u8 = 48;
    pub const U256_BIT_AND: u8 = 49;
    pub const U256_BIT_OR: u8 = 50;
    pub const U256_XOR: u8 = 51;
    pub const U256_SHL: u8 = 52;
    pub const U256_SHR: u8 = 53;
    pub const EQ_U256: u8 = 54;
    pub const NE_U256: u8 = 55;
    pub const LT_U256: u8 = 56;
    pub const LE_U256: u8 = 57;
    pub const GT_U256: u8 = 58;
    pub const GE_U256: u8 = 59;

    pub const I256_TO_U256: u8 = 60;
    pub const U256_TO_I256: u8 = 61;
    pub const BYTE_VEC_EQ: u8 = 62;
    pub const BYTE_VEC_NEQ: u8 = 63;
    pub const ADDRESS_EQ: u8 = 64;
    pub const ADDRESS_NEQ: u8 = 65;

    pub const JUMP: u8 = 66;
    pub const IF_TRUE: u8 = 67;
    pub const IF_FALSE: u8 = 68;
    pub const ASSERT: u8 = 69;

    pub const BLAKE2B: u8 = 70;
    pub const KECCAK256: u8 = 71;
    pub const SHA256: u8 = 72;
    pub const SHA3: u8 = 73;
    pub const CHECK_SIGNATURE: u8 = 74;
    pub const BLOCK_TIME_STAMP: u8 = 75;
    pub const BLOCK_TARGET: u8 = 76;

    pub const LOAD_FIELD: u8 = 160;
    pub const STORE_FIELD: u8 = 161;
    pub const APPROVE_ALF: u8 = 162;
    pub const APPROVE_TOKEN: u8 = 163;
    pub const ALF_REMAINING: u8 = 164;
    pub const TOKEN_REMAINING: u8 = 165;
    pub const TRANSFER_ALF: u8 = 166;
    pub const TRANSFER_ALF_FROM_SELF: u8 = 167;
    pub const TRANSFER_ALF_TO_SELF: u8 = 168;
    pub const TRANSFER_TOKEN: u8 = 169;
    pub const TRANSFER_TOKEN_FROM_SELF: u8 = 170;
    pub const TRANSFER_TOKEN_TO_SELF: u8 = 171;
    pub const CREATE_CONTRACT: u8 = 172;
    pub const COPY_CREATE_CONTRACT: u8 = 173;
    pub const DESTROY_CONTRACT: u8 = 174;
    pub const SELF_ADDRESS: u8 = 175;
    pub const SELF_CONTRACT_ID: u8 = 176;
    pub const ISSUE_TOKEN: u8 = 177;
    pub const CALLER_ADDRESS: u8 = 178;
    pub const CALLER_CODE_HASH: u8 = 179;
    pub const CONTRACT_CODE_HASH: u8 = 180;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    CallLocal(u8),
    CallExternal(u8),
    Return,

    ConstTrue,
    ConstFalse,
    I256Const0,
    I256Const1,
    I256Const2,
    I256Const3,
    I256Const4,
    I256Const5,
    I256ConstN1,
    U256Const0,
    U256Const1,
    U256Const2,
    U256Const3,
    U256Const4,
    U256Const5,
    I256Const(I256),
    U256Const(U256),
    BytesConst(Bytes),
    AddressConst(LockupScript),

    LoadLocal(u8),
    StoreLocal(u8),
    Pop,

    NotBool,
    AndBool,
    OrBool,
    EqBool,
    NeBool,

    I256Add,
    I256Sub,
    I256Mul,
    I256Div,
    I256Mod,
    EqI256,
    NeI256,
    LtI256,
    LeI256,
    GtI256,
    GeI256,

    U256Add,
    U256Sub,
    U256Mul,
    U256Div,
    U256Mod,
    U256ModAdd,
    U256ModSub,
    U256ModMul,
    U256BitAnd,
    U256BitOr,
    U256Xor,
    U256Shl,
    U256Shr,
    EqU256,
    NeU256,
    LtU256,
    LeU256,
    GtU256,
    GeU256,

    I256ToU256,
    U256ToI256,
    ByteVecEq,
    ByteVecNeq,
    AddressEq,
    AddressNeq,

    Jump(i32),
    IfTrue(i32),
    IfFalse(i32),
    Assert,

    Blake2b,
    Keccak256,
    Sha256,
    Sha3,
    CheckSignature,
    BlockTimeStamp,
    BlockTarget,

    LoadField(u8),
    StoreField(u8),
    ApproveAlf,
    ApproveToken,
    AlfRemaining,
    TokenRemaining,
    TransferAlf,
    TransferAlfFromSelf,
    TransferAlfToSelf,
    TransferToken,
    TransferTokenFromSelf,
    TransferTokenToSelf,
    CreateContract,
    CopyCreateContract,
    DestroyContract,
    SelfAddress,
    SelfContractId,
    IssueToken,
    CallerAddress,
    CallerCodeHash,
    ContractCodeHash,
}

/// Which decode table is active: stateless scripts reject stateful-only
/// opcodes (and `CallExternal`).
static STATELESS_TABLE: Lazy<[bool; 256]> = Lazy::new(|| build_table(false));
static STATEFUL_TABLE: Lazy<[bool; 256]> = Lazy::new(|| build_table(true));

fn build_table(stateful: bool) -> [bool; 256] {
    let mut table = [false; 256];
    let mut code = 0usize;
    while code < 256 {
        table[code] = match code as u8 {
            opcodes::CALL_EXTERNAL => stateful,
            opcodes::CALL_LOCAL..=opcodes::BLOCK_TARGET => true,
            opcodes::LOAD_FIELD..=opcodes::CONTRACT_CODE_HASH => stateful,
            _ => false,
        };
        code += 1;
    }
    table
}

pub fn opcode_assigned(code: u8, stateful: bool) -> bool {
    if stateful {
        STATEFUL_TABLE[code as usize]
    } else {
        STATELESS_TABLE[code as usize]
    }
}

fn encode_offset(offset: i32, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    if !(-MAX_JUMP_OFFSET..=MAX_JUMP_OFFSET).contains(&offset) {
        return Err(CodecError::InvalidOffset);
    }
    buf.extend_from_slice(&offset.to_be_bytes());
    Ok(())
}

fn decode_offset(r: &mut Reader) -> Result<i32, CodecError> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(r.read_slice(4)?);
    let offset = i32::from_be_bytes(bytes);
    if !(-MAX_JUMP_OFFSET..=MAX_JUMP_OFFSET).contains(&offset) {
        return Err(CodecError::InvalidOffset);
    }
    Ok(offset)
}

impl Instr {
    pub fn opcode(&self) -> u8 {
        use opcodes::*;
        match self {
            Instr::CallLocal(_) => CALL_LOCAL,
            Instr::CallExternal(_) => CALL_EXTERNAL,
            Instr::Return => RETURN,
            Instr::ConstTrue => CONST_TRUE,
            Instr::ConstFalse => CONST_FALSE,
            Instr::I256Const0 => I256_CONST_0,
            Instr::I256Const1 => I256_CONST_1,
            Instr::I256Const2 => I256_CONST_2,
            Instr::I256Const3 => I256_CONST_3,
            Instr::I256Const4 => I256_CONST_4,
            Instr::I256Const5 => I256_CONST_5,
            Instr::I256ConstN1 => I256_CONST_N1,
            Instr::U256Const0 => U256_CONST_0,
            Instr::U256Const1 => U256_CONST_1,
            Instr::U256Const2 => U256_CONST_2,
            Instr::U256Const3 => U256_CONST_3,
            Instr::U256Const4 => U256_CONST_4,
            Instr::U256Const5 => U256_CONST_5,
            Instr::I256Const(_) => I256_CONST,
            Instr::U256Const(_) => U256_CONST,
            Instr::BytesConst(_) => BYTES_CONST,
            Instr::AddressConst(_) => ADDRESS_CONST,
            Instr::LoadLocal(_) => LOAD_LOCAL,
            Instr::StoreLocal(_) => STORE_LOCAL,
            Instr::Pop => POP,
            Instr::NotBool => NOT_BOOL,
            Instr::AndBool => AND_BOOL,
            Instr::OrBool => OR_BOOL,
            Instr::EqBool => EQ_BOOL,
            Instr::NeBool => NE_BOOL,
            Instr::I256Add => I256_ADD,
            Instr::I256Sub => I256_SUB,
            Instr::I256Mul => I256_MUL,
            Instr::I256Div => I256_DIV,
            Instr::I256Mod => I256_MOD,
            Instr::EqI256 => EQ_I256,
            Instr::NeI256 => NE_I256,
            Instr::LtI256 => LT_I256,
            Instr::LeI256 => LE_I256,
            Instr::GtI256 => GT_I256,
            Instr::GeI256 => GE_I256,
            Instr::U256Add => U256_ADD,
            Instr::U256Sub => U256_SUB,
            Instr::U256Mul => U256_MUL,
            Instr::U256Div => U256_DIV,
            Instr::U256Mod => U256_MOD,
            Instr::U256ModAdd => U256_MOD_ADD,
            Instr::U256ModSub => U256_MOD_SUB,
            Instr::U256ModMul => U256_MOD_MUL,
            Instr::U256BitAnd => U256_BIT_AND,
            Instr::U256BitOr => U256_BIT_OR,
            Instr::U256Xor => U256_XOR,
            Instr::U256Shl => U256_SHL,
            Instr::U256Shr => U256_SHR,
            Instr::EqU256 => EQ_U256,
            Instr::NeU256 => NE_U256,
            Instr::LtU256 => LT_U256,
            Instr::LeU256 => LE_U256,
            Instr::GtU256 => GT_U256,
            Instr::GeU256 => GE_U256,
            Instr::I256ToU256 => I256_TO_U256,
            Instr::U256ToI256 => U256_TO_I256,
            Instr::ByteVecEq => BYTE_VEC_EQ,
            Instr::ByteVecNeq => BYTE_VEC_NEQ,
            Instr::AddressEq => ADDRESS_EQ,
            Instr::AddressNeq => ADDRESS_NEQ,
            Instr::Jump(_) => JUMP,
            Instr::IfTrue(_) => IF_TRUE,
            Instr::IfFalse(_) => IF_FALSE,
            Instr::Assert => ASSERT,
            Instr::Blake2b => BLAKE2B,
            Instr::Keccak256 => KECCAK256,
            Instr::Sha256 => SHA256,
            Instr::Sha3 => SHA3,
            Instr::CheckSignature => CHECK_SIGNATURE,
            Instr::BlockTimeStamp => BLOCK_TIME_STAMP,
            Instr::BlockTarget => BLOCK_TARGET,
            Instr::LoadField(_) => LOAD_FIELD,
            Instr::StoreField(_) => STORE_FIELD,
            Instr::ApproveAlf => APPROVE_ALF,
            Instr::ApproveToken => APPROVE_TOKEN,
            Instr::AlfRemaining => ALF_REMAINING,
            Instr::TokenRemaining => TOKEN_REMAINING,
            Instr::TransferAlf => TRANSFER_ALF,
            Instr::TransferAlfFromSelf => TRANSFER_ALF_FROM_SELF,
            Instr::TransferAlfToSelf => TRANSFER_ALF_TO_SELF,
            Instr::TransferToken => TRANSFER_TOKEN,
            Instr::TransferTokenFromSelf => TRANSFER_TOKEN_FROM_SELF,
            Instr::TransferTokenToSelf => TRANSFER_TOKEN_TO_SELF,
            Instr::CreateContract => CREATE_CONTRACT,
            Instr::CopyCreateContract => COPY_CREATE_CONTRACT,
            Instr::DestroyContract => DESTROY_CONTRACT,
            Instr::SelfAddress => SELF_ADDRESS,
            Instr::SelfContractId => SELF_CONTRACT_ID,
            Instr::IssueToken => ISSUE_TOKEN,
            Instr::CallerAddress => CALLER_ADDRESS,
            Instr::CallerCodeHash => CALLER_CODE_HASH,
            Instr::ContractCodeHash => CONTRACT_CODE_HASH,
        }
    }

    /// Static gas, charged before the instruction runs. Hash instructions add
    /// a per-word component at execution time.
    pub fn static_gas(&self) -> u64 {
        match self {
            Instr::Return => gas::G_ZERO,
            Instr::CallLocal(_) | Instr::CallExternal(_) => gas::G_CALL,
            Instr::BytesConst(_)
            | Instr::AddressConst(_)
            | Instr::ByteVecEq
            | Instr::ByteVecNeq
            | Instr::AddressEq
            | Instr::AddressNeq => gas::G_LOW,
            Instr::Jump(_) => gas::G_MID,
            Instr::IfTrue(_) | Instr::IfFalse(_) => gas::G_HIGH,
            Instr::Blake2b | Instr::Keccak256 | Instr::Sha256 | Instr::Sha3 => gas::G_HASH_BASE,
            Instr::CheckSignature => gas::G_SIGNATURE,
            Instr::BlockTimeStamp
            | Instr::BlockTarget
            | Instr::SelfAddress
            | Instr::SelfContractId
            | Instr::CallerAddress
            | Instr::CallerCodeHash => gas::G_BASE,
            Instr::ApproveAlf
            | Instr::ApproveToken
            | Instr::AlfRemaining
            | Instr::TokenRemaining
            | Instr::TransferAlf
            | Instr::TransferAlfFromSelf
            | Instr::TransferAlfToSelf
            | Instr::TransferToken
            | Instr::TransferTokenFromSelf
            | Instr::TransferTokenToSelf
            | Instr::IssueToken
            | Instr::ContractCodeHash => gas::G_BALANCE,
            Instr::CreateContract | Instr::CopyCreateContract => gas::G_CREATE,
            Instr::DestroyContract => gas::G_DESTROY,
            _ => gas::G_VERY_LOW,
        }
    }

    /// Serialized width in bytes, opcode included. Drives the byte-addressed
    /// pc and jump-target validation.
    pub fn encoded_len(&self) -> usize {
        match self {
            Instr::CallLocal(_)
            | Instr::CallExternal(_)
            | Instr::LoadLocal(_)
            | Instr::StoreLocal(_)
            | Instr::LoadField(_)
            | Instr::StoreField(_) => 2,
            Instr::I256Const(v) => 1 + codec::i256_encoded_len(v),
            Instr::U256Const(v) => 1 + codec::u256_encoded_len(v),
            Instr::BytesConst(bytes) => 1 + codec::bytes_encoded_len(bytes),
            Instr::AddressConst(script) => 1 + script.encoded_len(),
            Instr::Jump(_) | Instr::IfTrue(_) | Instr::IfFalse(_) => 5,
            _ => 1,
        }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(self.opcode());
        match self {
            Instr::CallLocal(index)
            | Instr::CallExternal(index)
            | Instr::LoadLocal(index)
            | Instr::StoreLocal(index)
            | Instr::LoadField(index)
            | Instr::StoreField(index) => buf.push(*index),
            Instr::I256Const(v) => codec::encode_i256(v, buf),
            Instr::U256Const(v) => codec::encode_u256(v, buf),
            Instr::BytesConst(bytes) => codec::encode_bytes(bytes, buf),
            Instr::AddressConst(script) => script.encode_to(buf),
            Instr::Jump(offset) | Instr::IfTrue(offset) | Instr::IfFalse(offset) => {
                encode_offset(*offset, buf)?
            }
            _ => {}
        }
        Ok(())
    }

    pub fn decode_stateless(r: &mut Reader) -> Result<Instr, CodecError> {
        Self::decode(r, false)
    }

    pub fn decode_stateful(r: &mut Reader) -> Result<Instr, CodecError> {
        Self::decode(r, true)
    }

    fn decode(r: &mut Reader, stateful: bool) -> Result<Instr, CodecError> {
        use opcodes::*;
        let code = r.read_byte()?;
        if !opcode_assigned(code, stateful) {
            return Err(CodecError::InvalidOpcode(code));
        }
        let instr = match code {
            CALL_LOCAL => Instr::CallLocal(r.read_byte()?),
            CALL_EXTERNAL => Instr::CallExternal(r.read_byte()?),
            RETURN => Instr::Return,
            CONST_TRUE => Instr::ConstTrue,
            CONST_FALSE => Instr::ConstFalse,
            I256_CONST_0 => Instr::I256Const0,
            I256_CONST_1 => Instr::I256Const1,
            I256_CONST_2 => Instr::I256Const2,
            I256_CONST_3 => Instr::I256Const3,
            I256_CONST_4 => Instr::I256Const4,
            I256_CONST_5 => Instr::I256Const5,
            I256_CONST_N1 => Instr::I256ConstN1,
            U256_CONST_0 => Instr::U256Const0,
            U256_CONST_1 => Instr::U256Const1,
            U256_CONST_2 => Instr::U256Const2,
            U256_CONST_3 => Instr::U256Const3,
            U256_CONST_4 => Instr::U256Const4,
            U256_CONST_5 => Instr::U256Const5,
            I256_CONST => Instr::I256Const(codec::decode_i256(r)?),
            U256_CONST => Instr::U256Const(codec::decode_u256(r)?),
            BYTES_CONST => Instr::BytesConst(codec::decode_bytes(r)?),
            ADDRESS_CONST => Instr::AddressConst(LockupScript::decode_from(r)?),
            LOAD_LOCAL => Instr::LoadLocal(r.read_byte()?),
            STORE_LOCAL => Instr::StoreLocal(r.read_byte()?),
            POP => Instr::Pop,
            NOT_BOOL => Instr::NotBool,
            AND_BOOL => Instr::AndBool,
            OR_BOOL => Instr::OrBool,
            EQ_BOOL => Instr::EqBool,
            NE_BOOL => Instr::NeBool,
            I256_ADD => Instr::I256Add,
            I256_SUB => Instr::I256Sub,
            I256_MUL => Instr::I256Mul,
            I256_DIV => Instr::I256Div,
            I256_MOD => Instr::I256Mod,
            EQ_I256 => Instr::EqI256,
            NE_I256 => Instr::NeI256,
            LT_I256 => Instr::LtI256,
            LE_I256 => Instr::LeI256,
            GT_I256 => Instr::GtI256,
            GE_I256 => Instr::GeI256,
            U256_ADD => Instr::U256Add,
            U256_SUB => Instr::U256Sub,
            U256_MUL => Instr::U256Mul,
            U256_DIV => Instr::U256Div,
            U256_MOD => Instr::U256Mod,
            U256_MOD_ADD => Instr::U256ModAdd,
            U256_MOD_SUB => Instr::U256ModSub,
            U256_MOD_MUL => Instr::U256ModMul,
            U256_BIT_AND => Instr::U256BitAnd,
            U256_BIT_OR => Instr::U256BitOr,
            U256_XOR => Instr::U256Xor,
            U256_SHL => Instr::U256Shl,
            U256_SHR => Instr::U256Shr,
            EQ_U256 => Instr::EqU256,
            NE_U256 => Instr::NeU256,
            LT_U256 => Instr::LtU256,
            LE_U256 => Instr::LeU256,
            GT_U256 => Instr::GtU256,
            GE_U256 => Instr::GeU256,
            I256_TO_U256 => Instr::I256ToU256,
            U256_TO_I256 => Instr::U256ToI256,
            BYTE_VEC_EQ => Instr::ByteVecEq,
            BYTE_VEC_NEQ => Instr::ByteVecNeq,
            ADDRESS_EQ => Instr::AddressEq,
            ADDRESS_NEQ => Instr::AddressNeq,
            JUMP => Instr::Jump(decode_offset(r)?),
            IF_TRUE => Instr::IfTrue(decode_offset(r)?),
            IF_FALSE => Instr::IfFalse(decode_offset(r)?),
            ASSERT => Instr::Assert,
            BLAKE2B => Instr::Blake2b,
            KECCAK256 => Instr::Keccak256,
            SHA256 => Instr::Sha256,
            SHA3 => Instr::Sha3,
            CHECK_SIGNATURE => Instr::CheckSignature,
            BLOCK_TIME_STAMP => Instr::BlockTimeStamp,
            BLOCK_TARGET => Instr::BlockTarget,
            LOAD_FIELD => Instr::LoadField(r.read_byte()?),
            STORE_FIELD => Instr::StoreField(r.read_byte()?),
            APPROVE_ALF => Instr::ApproveAlf,
            APPROVE_TOKEN => Instr::ApproveToken,
            ALF_REMAINING => Instr::AlfRemaining,
            TOKEN_REMAINING => Instr::TokenRemaining,
            TRANSFER_ALF => Instr::TransferAlf,
            TRANSFER_ALF_FROM_SELF => Instr::TransferAlfFromSelf,
            TRANSFER_ALF_TO_SELF => Instr::TransferAlfToSelf,
            TRANSFER_TOKEN => Instr::TransferToken,
            TRANSFER_TOKEN_FROM_SELF => Instr::TransferTokenFromSelf,
            TRANSFER_TOKEN_TO_SELF => Instr::TransferTokenToSelf,
            CREATE_CONTRACT => Instr::CreateContract,
            COPY_CREATE_CONTRACT => Instr::CopyCreateContract,
            DESTROY_CONTRACT => Instr::DestroyContract,
            SELF_ADDRESS => Instr::SelfAddress,
            SELF_CONTRACT_ID => Instr::SelfContractId,
            ISSUE_TOKEN => Instr::IssueToken,
            CALLER_ADDRESS => Instr::CallerAddress,
            CALLER_CODE_HASH => Instr::CallerCodeHash,
            CONTRACT_CODE_HASH => Instr::ContractCodeHash,
            other => return Err(CodecError::InvalidOpcode(other)),
        };
        Ok(instr)
    }
}
