use blake2::digest::consts::U32;
use blake2::Blake2b;
use ethereum_types::H256;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use sha2::Sha256;
use sha3::{Digest, Keccak256, Sha3_256};

use crate::vm::error::{VmError, VmResult};

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 is the protocol hash: contract ids, code hashes, tx ids.
pub fn blake2b256(data: &[u8]) -> H256 {
    H256::from_slice(&Blake2b256::digest(data))
}

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

pub fn sha256(data: &[u8]) -> H256 {
    H256::from_slice(&Sha256::digest(data))
}

pub fn sha3_256(data: &[u8]) -> H256 {
    H256::from_slice(&Sha3_256::digest(data))
}

pub const PUBLIC_KEY_LENGTH: usize = 33;
pub const SIGNATURE_LENGTH: usize = 64;

/// Verify a 64-byte (r ‖ s) secp256k1 signature over a 32-byte message hash.
/// The public key must be SEC1-compressed.
pub fn verify_signature(msg_hash: &H256, public_key: &[u8], signature: &[u8]) -> VmResult {
    if public_key.len() != PUBLIC_KEY_LENGTH {
        return Err(VmError::InvalidPublicKey);
    }
    let key = VerifyingKey::from_sec1_bytes(public_key).map_err(|_| VmError::InvalidPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| VmError::VerificationFailed)?;
    key.verify_prehash(msg_hash.as_bytes(), &sig)
        .map_err(|_| VmError::VerificationFailed)
}
