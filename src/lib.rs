//! Execution engine for an ALF-style UTXO-plus-contract chain: typed-stack
//! bytecode interpreter, gas accounting, asset balance tracking, and the
//! transaction structures the interpreter consumes and produces.

pub mod common;
pub mod lockup;
pub mod transaction;
pub mod vm;
pub mod world_state;
