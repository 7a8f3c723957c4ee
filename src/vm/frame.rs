//! One invocation record: a bounded typed operand stack, locals initialized
//! from call arguments, and a byte-addressed program counter validated
//! against instruction starts.

use bytes::Bytes;
use ethereum_types::U256;

use crate::common::constants::OPERAND_STACK_SIZE;
use crate::lockup::LockupScript;
use crate::vm::balance::BalanceState;
use crate::vm::error::{VmError, VmResult};
use crate::vm::i256::I256;
use crate::vm::instr::Instr;
use crate::vm::script::Method;
use crate::vm::value::Val;

pub struct Frame {
    pub obj_idx: usize,
    pub method_idx: usize,
    method: Method,
    offsets: Vec<usize>,
    code_len: usize,
    pc: usize,
    locals: Vec<Val>,
    stack: Vec<Val>,
    pub balance: Option<BalanceState>,
}

impl Frame {
    pub fn new(
        obj_idx: usize,
        method_idx: usize,
        method: Method,
        locals: Vec<Val>,
        balance: Option<BalanceState>,
    ) -> Self {
        let (offsets, code_len) = method.instr_offsets();
        Self {
            obj_idx,
            method_idx,
            method,
            offsets,
            code_len,
            pc: 0,
            locals,
            stack: vec![],
            balance,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_payable(&self) -> bool {
        self.balance.is_some()
    }

    pub fn balance_mut(&mut self) -> VmResult<&mut BalanceState> {
        self.balance.as_mut().ok_or(VmError::NonPayableFrame)
    }

    /// Byte address the frame has advanced to.
    pub fn pc_byte(&self) -> usize {
        self.offsets.get(self.pc).copied().unwrap_or(self.code_len)
    }

    /// Next instruction, or `None` once the code is exhausted (which the
    /// driver treats as a missing `Return`).
    pub fn fetch(&mut self) -> Option<Instr> {
        let instr = self.method.instrs.get(self.pc)?.clone();
        self.pc += 1;
        Some(instr)
    }

    /// Relocate the pc by `delta` bytes from the current position. The target
    /// must be the start of an instruction.
    pub fn offset_pc(&mut self, delta: i32) -> VmResult {
        let target = self.pc_byte() as i64 + delta as i64;
        if target < 0 {
            return Err(VmError::InvalidPC);
        }
        match self.offsets.binary_search(&(target as usize)) {
            Ok(index) => {
                self.pc = index;
                Ok(())
            }
            Err(_) => Err(VmError::InvalidPC),
        }
    }

    /* ------------------------------ stack ------------------------------ */

    pub fn push(&mut self, val: Val) -> VmResult {
        if self.stack.len() >= OPERAND_STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(val);
        Ok(())
    }

    pub fn pop(&mut self) -> VmResult<Val> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    pub fn pop_bool(&mut self) -> VmResult<bool> {
        match self.pop()? {
            Val::Bool(v) => Ok(v),
            _ => Err(VmError::InvalidType),
        }
    }

    pub fn pop_i256(&mut self) -> VmResult<I256> {
        match self.pop()? {
            Val::I256(v) => Ok(v),
            _ => Err(VmError::InvalidType),
        }
    }

    pub fn pop_u256(&mut self) -> VmResult<U256> {
        match self.pop()? {
            Val::U256(v) => Ok(v),
            _ => Err(VmError::InvalidType),
        }
    }

    pub fn pop_bytes(&mut self) -> VmResult<Bytes> {
        match self.pop()? {
            Val::ByteVec(v) => Ok(v),
            _ => Err(VmError::InvalidType),
        }
    }

    pub fn pop_address(&mut self) -> VmResult<LockupScript> {
        match self.pop()? {
            Val::Address(v) => Ok(v),
            _ => Err(VmError::InvalidType),
        }
    }

    /// Pop `n` values, restoring pushed order.
    pub fn pop_many(&mut self, n: usize) -> VmResult<Vec<Val>> {
        let mut vals = Vec::with_capacity(n);
        for _ in 0..n {
            vals.push(self.pop()?);
        }
        vals.reverse();
        Ok(vals)
    }

    /* ------------------------------ locals ------------------------------ */

    pub fn get_local(&self, index: u8) -> VmResult<Val> {
        self.locals
            .get(index as usize)
            .cloned()
            .ok_or(VmError::OutOfBound)
    }

    pub fn set_local(&mut self, index: u8, val: Val) -> VmResult {
        let slot = self
            .locals
            .get_mut(index as usize)
            .ok_or(VmError::OutOfBound)?;
        if slot.type_of() != val.type_of() {
            return Err(VmError::InvalidType);
        }
        *slot = val;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::Type;

    fn frame_with(instrs: Vec<Instr>, locals: Vec<Val>) -> Frame {
        let locals_type = locals.iter().map(Val::type_of).collect();
        let method = Method {
            is_public: true,
            is_payable: false,
            locals_type,
            return_type: vec![],
            instrs,
        };
        Frame::new(0, 0, method, locals, None)
    }

    #[test]
    fn test_stack_bounds() {
        let mut frame = frame_with(vec![], vec![]);
        for _ in 0..OPERAND_STACK_SIZE {
            frame.push(Val::Bool(true)).unwrap();
        }
        assert_eq!(frame.push(Val::Bool(true)), Err(VmError::StackOverflow));
        for _ in 0..OPERAND_STACK_SIZE {
            frame.pop().unwrap();
        }
        assert_eq!(frame.pop(), Err(VmError::StackUnderflow));
    }

    #[test]
    fn test_typed_pop() {
        let mut frame = frame_with(vec![], vec![]);
        frame.push(Val::U256(U256::one())).unwrap();
        assert_eq!(frame.pop_bool(), Err(VmError::InvalidType));
        frame.push(Val::U256(U256::one())).unwrap();
        assert_eq!(frame.pop_u256(), Ok(U256::one()));
    }

    #[test]
    fn test_locals() {
        let mut frame = frame_with(vec![], vec![Val::U256(U256::zero())]);
        assert_eq!(frame.get_local(0), Ok(Val::U256(U256::zero())));
        assert_eq!(frame.get_local(1), Err(VmError::OutOfBound));
        assert_eq!(
            frame.set_local(0, Val::Bool(true)),
            Err(VmError::InvalidType)
        );
        assert_eq!(frame.set_local(0, Val::U256(U256::from(9u8))), Ok(()));
        assert_eq!(frame.get_local(0), Ok(Val::U256(U256::from(9u8))));
    }

    #[test]
    fn test_offset_pc_lands_on_instruction_starts() {
        // widths 1 (U256Const0), 5 (Jump), 1 (Return): starts at 0, 1, 6
        let mut frame = frame_with(
            vec![Instr::U256Const0, Instr::Jump(-5), Instr::Return],
            vec![],
        );
        frame.fetch().unwrap();
        frame.fetch().unwrap(); // pc now at byte 6
        assert_eq!(frame.pc_byte(), 6);
        assert_eq!(frame.offset_pc(-5), Ok(()));
        assert_eq!(frame.pc_byte(), 1);
        // byte 2 is the middle of the jump payload
        assert_eq!(frame.offset_pc(1), Err(VmError::InvalidPC));
        // past the end of code
        assert_eq!(frame.offset_pc(7), Err(VmError::InvalidPC));
    }

    #[test]
    fn test_fetch_exhaustion() {
        let mut frame = frame_with(vec![Instr::Return], vec![]);
        assert_eq!(frame.fetch(), Some(Instr::Return));
        assert_eq!(frame.fetch(), None);
    }
}
