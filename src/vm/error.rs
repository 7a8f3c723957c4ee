/// Every way script execution can abort. There is no in-VM recovery: any of
/// these unwinds all frames and rolls the enclosing transaction back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    StackOverflow,
    StackUnderflow,
    InvalidType,
    OutOfBound,
    InvalidPC,
    InvalidCode(u8),
    InvalidOffset,
    OutOfGas,
    ArithmeticError,
    InvalidConversion,
    AssertionFailed,
    InvalidPublicKey,
    VerificationFailed,
    NotEnoughBalance,
    BalanceOverflow,
    NoAlfBalanceForTheAddress,
    NoTokenBalanceForTheAddress,
    InvalidTokenId,
    ExpectACaller,
    NonPayableFrame,
    ContractNotFound,
    PrivateMethod,
    InvalidMethodArgLength,
    InvalidMethodParamsType,
    SerdeErrorCreateContract,
    NegativeTimeStamp,
    InvalidTarget,
    InvalidIssueToken,
}

pub type VmResult<T = ()> = Result<T, VmError>;

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::InvalidCode(op) => write!(f, "InvalidCode({:#04x})", op),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for VmError {}
