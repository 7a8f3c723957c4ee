pub mod balance;
pub mod error;
pub mod frame;
pub mod gas;
pub mod i256;
pub mod instr;
pub mod runtime;
pub mod script;
pub mod value;

pub use error::{VmError, VmResult};
pub use i256::I256;
pub use instr::Instr;
pub use value::{Type, Val};
