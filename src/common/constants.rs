use ethereum_types::U256;

/// Gas cost table. These values are consensus-critical.
pub mod gas {
    pub const G_ZERO: u64 = 0;
    pub const G_BASE: u64 = 2;
    pub const G_VERY_LOW: u64 = 3;
    pub const G_LOW: u64 = 5;
    pub const G_MID: u64 = 8;
    pub const G_HIGH: u64 = 10;
    pub const G_CALL: u64 = 100;
    pub const G_CREATE: u64 = 32000;
    pub const G_DESTROY: u64 = 5000;
    pub const G_BALANCE: u64 = 30;
    pub const G_HASH_BASE: u64 = 30;
    pub const G_HASH_PER_WORD: u64 = 6;
    pub const G_SIGNATURE: u64 = 2000;
}

pub const OPERAND_STACK_SIZE: usize = 1024;
pub const FRAME_DEPTH_LIMIT: usize = 1024;

/// Jump offsets outside [-65536, 65536] are rejected at (de)serialization.
pub const MAX_JUMP_OFFSET: i32 = 1 << 16;

pub const MAX_TX_INPUT_NUM: usize = 256;
pub const MAX_TOKEN_PER_UTXO: usize = 64;

/// Smallest ALPH amount (in attos) an output with no tokens may carry.
pub const MINIMAL_ALF_PER_OUTPUT: u64 = 1_000_000_000_000_000;

/// Each token carried by an output raises the required ALPH floor.
pub fn minimal_alf_amount_per_tx_output(token_count: usize) -> U256 {
    U256::from(MINIMAL_ALF_PER_OUTPUT) * U256::from(token_count as u64 + 1)
}

pub const DEFAULT_TX_VERSION: u8 = 0;
