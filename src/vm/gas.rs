use crate::common::constants::gas;
use crate::vm::error::{VmError, VmResult};

/// Transaction-scoped gas meter. Charging happens before side effects, so an
/// aborted transaction still reports the gas burned up to the failing
/// instruction.
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: u64,
    used: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn charge(&mut self, amount: u64) -> VmResult {
        let used = self.used.checked_add(amount).ok_or(VmError::OutOfGas)?;
        if used > self.limit {
            return Err(VmError::OutOfGas);
        }
        self.used = used;
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }
}

pub fn word_count(len: usize) -> u64 {
    (len as u64 + 31) / 32
}

/// Size-proportional cost of hashing `len` input bytes, on top of the static
/// `G_HASH_BASE` already charged at dispatch.
pub fn hash_extra_gas(len: usize) -> u64 {
    gas::G_HASH_PER_WORD * word_count(len)
}
