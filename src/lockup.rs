//! Lockup scripts: the predicate forms guarding outputs, their wire encoding,
//! the derived script hint used for shard-group assignment, and the base58
//! address form.

use ethereum_types::H256;

use crate::common::codec::{self, CodecError, Reader};

pub type ContractId = H256;
pub type TokenId = H256;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockupScript {
    P2pkh(H256),
    P2mpkh { pk_hashes: Vec<H256>, m: u32 },
    P2sh(H256),
    P2c(ContractId),
}

impl LockupScript {
    pub fn p2mpkh(pk_hashes: Vec<H256>, m: u32) -> Option<Self> {
        if m == 0 || m as usize >= pk_hashes.len() {
            return None;
        }
        Some(LockupScript::P2mpkh { pk_hashes, m })
    }

    pub fn tag(&self) -> u8 {
        match self {
            LockupScript::P2pkh(_) => 0,
            LockupScript::P2mpkh { .. } => 1,
            LockupScript::P2sh(_) => 2,
            LockupScript::P2c(_) => 3,
        }
    }

    /// P2C guards contract outputs only; the other three guard asset outputs.
    pub fn is_asset(&self) -> bool {
        !matches!(self, LockupScript::P2c(_))
    }

    fn hint_seed(&self) -> &H256 {
        match self {
            LockupScript::P2pkh(hash) => hash,
            LockupScript::P2mpkh { pk_hashes, .. } => &pk_hashes[0],
            LockupScript::P2sh(hash) => hash,
            LockupScript::P2c(id) => id,
        }
    }

    /// Group-assignment hash, forced odd so it never collides with the
    /// all-zero "no hint" marker.
    pub fn script_hint(&self) -> u32 {
        djb2(self.hint_seed().as_bytes()) | 1
    }

    pub fn group_index(&self, groups: u32) -> u32 {
        self.script_hint() % groups
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        match self {
            LockupScript::P2pkh(hash) | LockupScript::P2sh(hash) | LockupScript::P2c(hash) => {
                codec::encode_h256(hash, buf);
            }
            LockupScript::P2mpkh { pk_hashes, m } => {
                codec::encode_len(pk_hashes.len(), buf);
                for hash in pk_hashes {
                    codec::encode_h256(hash, buf);
                }
                codec::encode_varint(*m as u64, buf);
            }
        }
    }

    pub fn decode_from(r: &mut Reader) -> Result<Self, CodecError> {
        match r.read_byte()? {
            0 => Ok(LockupScript::P2pkh(codec::decode_h256(r)?)),
            1 => {
                let n = codec::decode_len(r)?;
                let mut pk_hashes = Vec::with_capacity(n);
                for _ in 0..n {
                    pk_hashes.push(codec::decode_h256(r)?);
                }
                let m = codec::decode_varint(r)?;
                if m > u32::MAX as u64 {
                    return Err(CodecError::InvalidLength);
                }
                LockupScript::p2mpkh(pk_hashes, m as u32).ok_or(CodecError::InvalidLength)
            }
            2 => Ok(LockupScript::P2sh(codec::decode_h256(r)?)),
            3 => Ok(LockupScript::P2c(codec::decode_h256(r)?)),
            tag => Err(CodecError::InvalidTag(tag)),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            LockupScript::P2mpkh { pk_hashes, m } => {
                1 + codec::varint_len(pk_hashes.len() as u64)
                    + 32 * pk_hashes.len()
                    + codec::varint_len(*m as u64)
            }
            _ => 1 + 32,
        }
    }

    pub fn serialization(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf
    }

    pub fn deserialization(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let script = Self::decode_from(&mut r)?;
        r.finish()?;
        Ok(script)
    }

    /// Human-readable address: base58 over the wire bytes.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.serialization()).into_string()
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        let bytes = bs58::decode(s).into_vec().ok()?;
        Self::deserialization(&bytes).ok()
    }
}

fn djb2(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}
