//! The execution driver. Owns the frame stack, the gas meter, the loaded
//! contract objects, and the transaction-wide output-balance accumulator, and
//! interprets instructions until the root frame returns or an error unwinds
//! the transaction.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use ethereum_types::{H256, U256};

use crate::common::codec;
use crate::common::constants::FRAME_DEPTH_LIMIT;
use crate::common::crypto;
use crate::lockup::{ContractId, LockupScript, TokenId};
use crate::transaction::{AssetOutput, AssetOutputRef, ContractOutput, TxOutput};
use crate::vm::balance::{BalanceState, Balances};
use crate::vm::error::{VmError, VmResult};
use crate::vm::frame::Frame;
use crate::vm::gas::{hash_extra_gas, GasMeter};
use crate::vm::i256::I256;
use crate::vm::instr::Instr;
use crate::vm::script::{Method, StatefulContract, StatefulScript, StatelessScript};
use crate::vm::value::Val;
use crate::world_state::{ContractRecord, WorldState};

/// Immutable block context captured before execution starts.
#[derive(Debug, Clone)]
pub struct BlockEnv {
    /// Milliseconds since the epoch; negative values fail `BlockTimeStamp`.
    pub time_stamp: i64,
    pub target: U256,
}

/// Transaction context the interpreter reads: the id signatures are checked
/// against, the signature stack itself, and the input ref seeding contract
/// ids.
#[derive(Debug, Clone)]
pub struct TxEnv {
    pub tx_id: H256,
    pub signatures: Vec<Bytes>,
    pub first_input: Option<AssetOutputRef>,
}

/// A code object frames execute against: the root script, or a contract
/// loaded through the world state.
struct ContractObj {
    address: Option<ContractId>,
    code_hash: H256,
    methods: Vec<Method>,
    fields: Vec<Val>,
    dirty: bool,
}

#[derive(Debug)]
pub struct ScriptResult {
    pub returns: Vec<Val>,
    pub gas_used: u64,
    pub generated_outputs: Vec<TxOutput>,
}

pub struct Runtime<'a> {
    world: Option<&'a mut dyn WorldState>,
    block: BlockEnv,
    tx: TxEnv,
    gas: GasMeter,
    frames: Vec<Frame>,
    objs: Vec<ContractObj>,
    loaded: BTreeMap<ContractId, usize>,
    asset_loaded: BTreeSet<ContractId>,
    output_balances: Balances,
    next_signature: usize,
    contracts_created: u64,
    token_issued: bool,
    last_opcode: u8,
}

impl<'a> Runtime<'a> {
    pub fn stateless(block: BlockEnv, tx: TxEnv, gas_amount: u64) -> Self {
        Self::new(None, block, tx, gas_amount)
    }

    pub fn stateful(
        world: &'a mut dyn WorldState,
        block: BlockEnv,
        tx: TxEnv,
        gas_amount: u64,
    ) -> Self {
        Self::new(Some(world), block, tx, gas_amount)
    }

    fn new(
        world: Option<&'a mut dyn WorldState>,
        block: BlockEnv,
        tx: TxEnv,
        gas_amount: u64,
    ) -> Self {
        Self {
            world,
            block,
            tx,
            gas: GasMeter::new(gas_amount),
            frames: vec![],
            objs: vec![],
            loaded: BTreeMap::new(),
            asset_loaded: BTreeSet::new(),
            output_balances: Balances::new(),
            next_signature: 0,
            contracts_created: 0,
            token_issued: false,
            last_opcode: 0,
        }
    }

    pub fn gas_used(&self) -> u64 {
        self.gas.used()
    }

    /// Diagnostics for abort reports: last dispatched opcode, byte pc of the
    /// active frame, and the frame depth.
    pub fn abort_context(&self) -> (u8, usize, usize) {
        let pc = self.frames.last().map(Frame::pc_byte).unwrap_or(0);
        (self.last_opcode, pc, self.frames.len())
    }

    /// Run a stateless script, e.g. to validate a P2SH spend.
    pub fn run_stateless_script(
        &mut self,
        script: &StatelessScript,
        fields: Vec<Val>,
        args: Vec<Val>,
    ) -> VmResult<Vec<Val>> {
        check_field_types(&fields, &script.fields)?;
        self.objs.push(ContractObj {
            address: None,
            code_hash: H256::zero(),
            methods: script.methods.clone(),
            fields,
            dirty: false,
        });
        self.start_root(args)?;
        self.run_loop()
    }

    /// Run a transaction's stateful script. Input balances seed the root
    /// frame when its entry method is payable.
    pub fn run_stateful_script(
        &mut self,
        script: &StatefulScript,
        fields: Vec<Val>,
        args: Vec<Val>,
        input_balances: Balances,
    ) -> VmResult<ScriptResult> {
        check_field_types(&fields, &script.fields)?;
        self.objs.push(ContractObj {
            address: None,
            code_hash: H256::zero(),
            methods: script.methods.clone(),
            fields,
            dirty: false,
        });
        let entry = self.objs[0].methods.first().ok_or(VmError::OutOfBound)?;
        let balance = entry
            .is_payable
            .then(|| BalanceState::from_remaining(input_balances));
        self.start_root_with_balance(args, balance)?;
        let returns = self.run_loop()?;
        let generated_outputs = self.finalize()?;
        Ok(ScriptResult {
            returns,
            gas_used: self.gas.used(),
            generated_outputs,
        })
    }

    fn start_root(&mut self, args: Vec<Val>) -> VmResult {
        self.start_root_with_balance(args, None)
    }

    fn start_root_with_balance(
        &mut self,
        args: Vec<Val>,
        balance: Option<BalanceState>,
    ) -> VmResult {
        let method = self.objs[0]
            .methods
            .first()
            .cloned()
            .ok_or(VmError::OutOfBound)?;
        if args.len() != method.locals_type.len() {
            return Err(VmError::InvalidMethodArgLength);
        }
        for (arg, ty) in args.iter().zip(&method.locals_type) {
            if arg.type_of() != *ty {
                return Err(VmError::InvalidMethodParamsType);
            }
        }
        self.frames.push(Frame::new(0, 0, method, args, balance));
        Ok(())
    }

    fn run_loop(&mut self) -> VmResult<Vec<Val>> {
        loop {
            let instr = {
                let frame = self.frames.last_mut().ok_or(VmError::InvalidPC)?;
                // running past the end of a method means it never returned
                frame.fetch().ok_or(VmError::InvalidPC)?
            };
            self.last_opcode = instr.opcode();
            self.gas.charge(instr.static_gas())?;
            if let Some(returns) = self.execute(instr)? {
                return Ok(returns);
            }
        }
    }

    fn cur(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap()
    }

    fn world_mut(&mut self) -> VmResult<&mut dyn WorldState> {
        let opcode = self.last_opcode;
        match self.world.as_deref_mut() {
            Some(world) => Ok(world),
            None => Err(VmError::InvalidCode(opcode)),
        }
    }

    fn execute(&mut self, instr: Instr) -> VmResult<Option<Vec<Val>>> {
        match instr {
            Instr::CallLocal(index) => self.op_call_local(index)?,
            Instr::CallExternal(index) => self.op_call_external(index)?,
            Instr::Return => return self.op_return(),

            Instr::ConstTrue => self.cur().push(Val::Bool(true))?,
            Instr::ConstFalse => self.cur().push(Val::Bool(false))?,
            Instr::I256Const0 => self.cur().push(Val::I256(I256::from_i64(0)))?,
            Instr::I256Const1 => self.cur().push(Val::I256(I256::from_i64(1)))?,
            Instr::I256Const2 => self.cur().push(Val::I256(I256::from_i64(2)))?,
            Instr::I256Const3 => self.cur().push(Val::I256(I256::from_i64(3)))?,
            Instr::I256Const4 => self.cur().push(Val::I256(I256::from_i64(4)))?,
            Instr::I256Const5 => self.cur().push(Val::I256(I256::from_i64(5)))?,
            Instr::I256ConstN1 => self.cur().push(Val::I256(I256::from_i64(-1)))?,
            Instr::U256Const0 => self.cur().push(Val::U256(U256::from(0u8)))?,
            Instr::U256Const1 => self.cur().push(Val::U256(U256::from(1u8)))?,
            Instr::U256Const2 => self.cur().push(Val::U256(U256::from(2u8)))?,
            Instr::U256Const3 => self.cur().push(Val::U256(U256::from(3u8)))?,
            Instr::U256Const4 => self.cur().push(Val::U256(U256::from(4u8)))?,
            Instr::U256Const5 => self.cur().push(Val::U256(U256::from(5u8)))?,
            Instr::I256Const(v) => self.cur().push(Val::I256(v))?,
            Instr::U256Const(v) => self.cur().push(Val::U256(v))?,
            Instr::BytesConst(v) => self.cur().push(Val::ByteVec(v))?,
            Instr::AddressConst(v) => self.cur().push(Val::Address(v))?,

            Instr::LoadLocal(index) => {
                let val = self.cur().get_local(index)?;
                self.cur().push(val)?
            }
            Instr::StoreLocal(index) => {
                let val = self.cur().pop()?;
                self.cur().set_local(index, val)?
            }
            Instr::Pop => {
                self.cur().pop()?;
            }

            Instr::NotBool => {
                let v = self.cur().pop_bool()?;
                self.cur().push(Val::Bool(!v))?
            }
            Instr::AndBool => self.bin_bool(|lhs, rhs| lhs && rhs)?,
            Instr::OrBool => self.bin_bool(|lhs, rhs| lhs || rhs)?,
            Instr::EqBool => self.bin_bool(|lhs, rhs| lhs == rhs)?,
            Instr::NeBool => self.bin_bool(|lhs, rhs| lhs != rhs)?,

            Instr::I256Add => self.bin_i256(|lhs, rhs| lhs.checked_add(rhs))?,
            Instr::I256Sub => self.bin_i256(|lhs, rhs| lhs.checked_sub(rhs))?,
            Instr::I256Mul => self.bin_i256(|lhs, rhs| lhs.checked_mul(rhs))?,
            Instr::I256Div => self.bin_i256(|lhs, rhs| lhs.checked_div(rhs))?,
            Instr::I256Mod => self.bin_i256(|lhs, rhs| lhs.checked_rem(rhs))?,
            Instr::EqI256 => self.cmp_i256(|lhs, rhs| lhs == rhs)?,
            Instr::NeI256 => self.cmp_i256(|lhs, rhs| lhs != rhs)?,
            Instr::LtI256 => self.cmp_i256(|lhs, rhs| lhs < rhs)?,
            Instr::LeI256 => self.cmp_i256(|lhs, rhs| lhs <= rhs)?,
            Instr::GtI256 => self.cmp_i256(|lhs, rhs| lhs > rhs)?,
            Instr::GeI256 => self.cmp_i256(|lhs, rhs| lhs >= rhs)?,

            Instr::U256Add => self.bin_u256(|lhs, rhs| lhs.checked_add(rhs))?,
            Instr::U256Sub => self.bin_u256(|lhs, rhs| lhs.checked_sub(rhs))?,
            Instr::U256Mul => self.bin_u256(|lhs, rhs| lhs.checked_mul(rhs))?,
            Instr::U256Div => self.bin_u256(|lhs, rhs| lhs.checked_div(rhs))?,
            Instr::U256Mod => self.bin_u256(|lhs, rhs| lhs.checked_rem(rhs))?,
            Instr::U256ModAdd => self.bin_u256(|lhs, rhs| Some(lhs.overflowing_add(rhs).0))?,
            Instr::U256ModSub => self.bin_u256(|lhs, rhs| Some(lhs.overflowing_sub(rhs).0))?,
            Instr::U256ModMul => self.bin_u256(|lhs, rhs| Some(lhs.overflowing_mul(rhs).0))?,
            Instr::U256BitAnd => self.bin_u256(|lhs, rhs| Some(lhs & rhs))?,
            Instr::U256BitOr => self.bin_u256(|lhs, rhs| Some(lhs | rhs))?,
            Instr::U256Xor => self.bin_u256(|lhs, rhs| Some(lhs ^ rhs))?,
            Instr::U256Shl => self.bin_u256(|lhs, rhs| Some(shift_left(lhs, rhs)))?,
            Instr::U256Shr => self.bin_u256(|lhs, rhs| Some(shift_right(lhs, rhs)))?,
            Instr::EqU256 => self.cmp_u256(|lhs, rhs| lhs == rhs)?,
            Instr::NeU256 => self.cmp_u256(|lhs, rhs| lhs != rhs)?,
            Instr::LtU256 => self.cmp_u256(|lhs, rhs| lhs < rhs)?,
            Instr::LeU256 => self.cmp_u256(|lhs, rhs| lhs <= rhs)?,
            Instr::GtU256 => self.cmp_u256(|lhs, rhs| lhs > rhs)?,
            Instr::GeU256 => self.cmp_u256(|lhs, rhs| lhs >= rhs)?,

            Instr::I256ToU256 => {
                let v = self.cur().pop_i256()?;
                let converted = v.to_u256().ok_or(VmError::InvalidConversion)?;
                self.cur().push(Val::U256(converted))?
            }
            Instr::U256ToI256 => {
                let v = self.cur().pop_u256()?;
                let converted = I256::from_u256(v).ok_or(VmError::InvalidConversion)?;
                self.cur().push(Val::I256(converted))?
            }
            Instr::ByteVecEq => self.cmp_bytes(|lhs, rhs| lhs == rhs)?,
            Instr::ByteVecNeq => self.cmp_bytes(|lhs, rhs| lhs != rhs)?,
            Instr::AddressEq => self.cmp_address(|lhs, rhs| lhs == rhs)?,
            Instr::AddressNeq => self.cmp_address(|lhs, rhs| lhs != rhs)?,

            Instr::Jump(offset) => self.cur().offset_pc(offset)?,
            Instr::IfTrue(offset) => {
                let cond = self.cur().pop_bool()?;
                if cond {
                    self.cur().offset_pc(offset)?;
                }
            }
            Instr::IfFalse(offset) => {
                let cond = self.cur().pop_bool()?;
                if !cond {
                    self.cur().offset_pc(offset)?;
                }
            }
            Instr::Assert => {
                if !self.cur().pop_bool()? {
                    return Err(VmError::AssertionFailed);
                }
            }

            Instr::Blake2b => self.op_hash(crypto::blake2b256)?,
            Instr::Keccak256 => self.op_hash(crypto::keccak256)?,
            Instr::Sha256 => self.op_hash(crypto::sha256)?,
            Instr::Sha3 => self.op_hash(crypto::sha3_256)?,
            Instr::CheckSignature => self.op_check_signature()?,
            Instr::BlockTimeStamp => {
                if self.block.time_stamp < 0 {
                    return Err(VmError::NegativeTimeStamp);
                }
                let ts = U256::from(self.block.time_stamp as u64);
                self.cur().push(Val::U256(ts))?
            }
            Instr::BlockTarget => {
                if self.block.target.is_zero() {
                    return Err(VmError::InvalidTarget);
                }
                let target = self.block.target;
                self.cur().push(Val::U256(target))?
            }

            Instr::LoadField(index) => {
                let obj_idx = self.cur().obj_idx;
                let val = self.objs[obj_idx]
                    .fields
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::OutOfBound)?;
                self.cur().push(val)?
            }
            Instr::StoreField(index) => {
                let val = self.cur().pop()?;
                let obj_idx = self.cur().obj_idx;
                let slot = self.objs[obj_idx]
                    .fields
                    .get_mut(index as usize)
                    .ok_or(VmError::OutOfBound)?;
                if slot.type_of() != val.type_of() {
                    return Err(VmError::InvalidType);
                }
                *slot = val;
                self.objs[obj_idx].dirty = true;
            }

            Instr::ApproveAlf => {
                let amount = self.cur().pop_u256()?;
                let address = self.cur().pop_address()?;
                self.cur().balance_mut()?.approve_alf(&address, amount)?;
            }
            Instr::ApproveToken => {
                let amount = self.cur().pop_u256()?;
                let token_id = token_id_from_bytes(&self.cur().pop_bytes()?)?;
                let address = self.cur().pop_address()?;
                self.cur()
                    .balance_mut()?
                    .approve_token(&address, token_id, amount)?;
            }
            Instr::AlfRemaining => {
                let address = self.cur().pop_address()?;
                let amount = self
                    .cur()
                    .balance_mut()?
                    .remaining
                    .alf_amount(&address)
                    .ok_or(VmError::NoAlfBalanceForTheAddress)?;
                self.cur().push(Val::U256(amount))?
            }
            Instr::TokenRemaining => {
                let token_id = token_id_from_bytes(&self.cur().pop_bytes()?)?;
                let address = self.cur().pop_address()?;
                let amount = self
                    .cur()
                    .balance_mut()?
                    .remaining
                    .token_amount(&address, &token_id)
                    .ok_or(VmError::NoTokenBalanceForTheAddress)?;
                self.cur().push(Val::U256(amount))?
            }
            Instr::TransferAlf => self.op_transfer_alf(false, false)?,
            Instr::TransferAlfFromSelf => self.op_transfer_alf(true, false)?,
            Instr::TransferAlfToSelf => self.op_transfer_alf(false, true)?,
            Instr::TransferToken => self.op_transfer_token(false, false)?,
            Instr::TransferTokenFromSelf => self.op_transfer_token(true, false)?,
            Instr::TransferTokenToSelf => self.op_transfer_token(false, true)?,

            Instr::CreateContract => self.op_create_contract(false)?,
            Instr::CopyCreateContract => self.op_create_contract(true)?,
            Instr::DestroyContract => self.op_destroy_contract()?,
            Instr::SelfAddress => {
                let lockup = self.self_lockup()?;
                self.cur().push(Val::Address(lockup))?
            }
            Instr::SelfContractId => {
                let id = self.current_contract_id()?;
                self.cur()
                    .push(Val::ByteVec(Bytes::copy_from_slice(id.as_bytes())))?
            }
            Instr::IssueToken => self.op_issue_token()?,
            Instr::CallerAddress => {
                let id = self.caller_contract_id()?;
                self.cur().push(Val::Address(LockupScript::P2c(id)))?
            }
            Instr::CallerCodeHash => {
                let caller_obj = self.caller_obj_idx()?;
                let hash = self.objs[caller_obj].code_hash;
                self.objs[caller_obj]
                    .address
                    .ok_or(VmError::ExpectACaller)?;
                self.cur()
                    .push(Val::ByteVec(Bytes::copy_from_slice(hash.as_bytes())))?
            }
            Instr::ContractCodeHash => {
                let id = contract_id_from_bytes(&self.cur().pop_bytes()?)?;
                let obj_idx = self.load_contract_obj(&id)?;
                let hash = self.objs[obj_idx].code_hash;
                self.cur()
                    .push(Val::ByteVec(Bytes::copy_from_slice(hash.as_bytes())))?
            }
        }
        Ok(None)
    }

    /* --------------------------- small helpers --------------------------- */

    fn bin_bool(&mut self, op: impl FnOnce(bool, bool) -> bool) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_bool()?;
        let lhs = frame.pop_bool()?;
        frame.push(Val::Bool(op(lhs, rhs)))
    }

    fn bin_u256(&mut self, op: impl FnOnce(U256, U256) -> Option<U256>) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_u256()?;
        let lhs = frame.pop_u256()?;
        let result = op(lhs, rhs).ok_or(VmError::ArithmeticError)?;
        frame.push(Val::U256(result))
    }

    fn cmp_u256(&mut self, op: impl FnOnce(&U256, &U256) -> bool) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_u256()?;
        let lhs = frame.pop_u256()?;
        frame.push(Val::Bool(op(&lhs, &rhs)))
    }

    fn bin_i256(&mut self, op: impl FnOnce(&I256, &I256) -> Option<I256>) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_i256()?;
        let lhs = frame.pop_i256()?;
        let result = op(&lhs, &rhs).ok_or(VmError::ArithmeticError)?;
        frame.push(Val::I256(result))
    }

    fn cmp_i256(&mut self, op: impl FnOnce(&I256, &I256) -> bool) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_i256()?;
        let lhs = frame.pop_i256()?;
        frame.push(Val::Bool(op(&lhs, &rhs)))
    }

    fn cmp_bytes(&mut self, op: impl FnOnce(&Bytes, &Bytes) -> bool) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_bytes()?;
        let lhs = frame.pop_bytes()?;
        frame.push(Val::Bool(op(&lhs, &rhs)))
    }

    fn cmp_address(&mut self, op: impl FnOnce(&LockupScript, &LockupScript) -> bool) -> VmResult {
        let frame = self.cur();
        let rhs = frame.pop_address()?;
        let lhs = frame.pop_address()?;
        frame.push(Val::Bool(op(&lhs, &rhs)))
    }

    fn op_hash(&mut self, hasher: fn(&[u8]) -> H256) -> VmResult {
        let data = self.cur().pop_bytes()?;
        self.gas.charge(hash_extra_gas(data.len()))?;
        let digest = hasher(&data);
        self.cur()
            .push(Val::ByteVec(Bytes::copy_from_slice(digest.as_bytes())))
    }

    fn op_check_signature(&mut self) -> VmResult {
        let public_key = self.cur().pop_bytes()?;
        let signature = self
            .tx
            .signatures
            .get(self.next_signature)
            .cloned()
            .ok_or(VmError::StackUnderflow)?;
        self.next_signature += 1;
        crypto::verify_signature(&self.tx.tx_id, &public_key, &signature)
    }

    /* ----------------------------- call/return ----------------------------- */

    fn op_call_local(&mut self, index: u8) -> VmResult {
        let obj_idx = self.cur().obj_idx;
        let method = self.objs[obj_idx]
            .methods
            .get(index as usize)
            .cloned()
            .ok_or(VmError::OutOfBound)?;
        self.push_callee_frame(obj_idx, index as usize, method)
    }

    fn op_call_external(&mut self, index: u8) -> VmResult {
        let id = contract_id_from_bytes(&self.cur().pop_bytes()?)?;
        let obj_idx = self.load_contract_obj(&id)?;
        let method = self.objs[obj_idx]
            .methods
            .get(index as usize)
            .cloned()
            .ok_or(VmError::OutOfBound)?;
        if !method.is_public {
            return Err(VmError::PrivateMethod);
        }
        self.push_callee_frame(obj_idx, index as usize, method)
    }

    fn push_callee_frame(&mut self, obj_idx: usize, method_idx: usize, method: Method) -> VmResult {
        if self.frames.len() >= FRAME_DEPTH_LIMIT {
            return Err(VmError::StackOverflow);
        }
        let args = self.cur().pop_many(method.locals_type.len())?;
        for (arg, ty) in args.iter().zip(&method.locals_type) {
            if arg.type_of() != *ty {
                return Err(VmError::InvalidMethodParamsType);
            }
        }
        let balance = if method.is_payable {
            // the caller's approved pool becomes the callee's spendable pool
            let approved = match self.cur().balance.as_mut() {
                Some(state) => state.take_approved(),
                None => Balances::new(),
            };
            let mut state = BalanceState::from_remaining(approved);
            self.load_contract_asset(obj_idx, &mut state)?;
            Some(state)
        } else {
            None
        };
        self.frames
            .push(Frame::new(obj_idx, method_idx, method, args, balance));
        Ok(())
    }

    /// A contract's stored assets become spendable the first time one of its
    /// payable methods runs in a transaction.
    fn load_contract_asset(&mut self, obj_idx: usize, state: &mut BalanceState) -> VmResult {
        let id = match self.objs[obj_idx].address {
            Some(id) => id,
            None => return Ok(()),
        };
        if !self.asset_loaded.insert(id) {
            return Ok(());
        }
        if let Some(asset) = self.world_mut()?.take_contract_asset(&id) {
            let lockup = LockupScript::P2c(id);
            state.remaining.add_alf(&lockup, asset.alf)?;
            for (token_id, amount) in asset.tokens {
                state.remaining.add_token(&lockup, token_id, amount)?;
            }
        }
        Ok(())
    }

    fn op_return(&mut self) -> VmResult<Option<Vec<Val>>> {
        let return_type = self.cur().method().return_type.clone();
        let vals = self.cur().pop_many(return_type.len())?;
        for (val, ty) in vals.iter().zip(&return_type) {
            if val.type_of() != *ty {
                return Err(VmError::InvalidType);
            }
        }
        let finished = self.frames.pop().unwrap();
        let leftovers = match finished.balance {
            Some(state) => Some(state.drain()?),
            None => None,
        };
        match self.frames.last_mut() {
            Some(caller) => {
                if let Some(leftovers) = leftovers {
                    // unused assets flow back to the caller, or straight to
                    // the tx outputs when the caller holds no balance
                    match caller.balance.as_mut() {
                        Some(state) => state.remaining.merge(leftovers)?,
                        None => self.output_balances.merge(leftovers)?,
                    }
                }
                for val in vals {
                    caller.push(val)?;
                }
                Ok(None)
            }
            None => {
                if let Some(leftovers) = leftovers {
                    self.output_balances.merge(leftovers)?;
                }
                Ok(Some(vals))
            }
        }
    }

    fn load_contract_obj(&mut self, id: &ContractId) -> VmResult<usize> {
        if let Some(&idx) = self.loaded.get(id) {
            return Ok(idx);
        }
        let record = self
            .world_mut()?
            .load_contract(id)
            .ok_or(VmError::ContractNotFound)?;
        let idx = self.objs.len();
        self.objs.push(ContractObj {
            address: Some(*id),
            code_hash: record.code_hash,
            methods: record.code.methods,
            fields: record.fields,
            dirty: false,
        });
        self.loaded.insert(*id, idx);
        Ok(idx)
    }

    /* ----------------------------- lifecycle ----------------------------- */

    fn current_contract_id(&self) -> VmResult<ContractId> {
        let obj_idx = self.frames.last().unwrap().obj_idx;
        self.objs[obj_idx].address.ok_or(VmError::ContractNotFound)
    }

    fn self_lockup(&self) -> VmResult<LockupScript> {
        Ok(LockupScript::P2c(self.current_contract_id()?))
    }

    fn caller_obj_idx(&self) -> VmResult<usize> {
        if self.frames.len() < 2 {
            return Err(VmError::ExpectACaller);
        }
        Ok(self.frames[self.frames.len() - 2].obj_idx)
    }

    fn caller_contract_id(&self) -> VmResult<ContractId> {
        let obj_idx = self.caller_obj_idx()?;
        self.objs[obj_idx].address.ok_or(VmError::ExpectACaller)
    }

    fn op_transfer_alf(&mut self, from_self: bool, to_self: bool) -> VmResult {
        let amount = self.cur().pop_u256()?;
        let to = if to_self {
            self.self_lockup()?
        } else {
            self.cur().pop_address()?
        };
        let from = if from_self {
            self.self_lockup()?
        } else {
            self.cur().pop_address()?
        };
        self.cur().balance_mut()?.remaining.use_alf(&from, amount)?;
        self.output_balances.add_alf(&to, amount)
    }

    fn op_transfer_token(&mut self, from_self: bool, to_self: bool) -> VmResult {
        let amount = self.cur().pop_u256()?;
        let token_id = token_id_from_bytes(&self.cur().pop_bytes()?)?;
        let to = if to_self {
            self.self_lockup()?
        } else {
            self.cur().pop_address()?
        };
        let from = if from_self {
            self.self_lockup()?
        } else {
            self.cur().pop_address()?
        };
        self.cur()
            .balance_mut()?
            .remaining
            .use_token(&from, &token_id, amount)?;
        self.output_balances.add_token(&to, token_id, amount)
    }

    fn op_create_contract(&mut self, copy: bool) -> VmResult {
        let fields_raw = self.cur().pop_bytes()?;
        let code = if copy {
            let id_raw = self.cur().pop_bytes()?;
            let source_id =
                contract_id_from_bytes(&id_raw).map_err(|_| VmError::SerdeErrorCreateContract)?;
            self.world_mut()?
                .load_contract(&source_id)
                .ok_or(VmError::ContractNotFound)?
                .code
        } else {
            let code_raw = self.cur().pop_bytes()?;
            StatefulContract::deserialization(&code_raw)
                .map_err(|_| VmError::SerdeErrorCreateContract)?
        };
        let fields =
            Val::decode_vec(&fields_raw).map_err(|_| VmError::SerdeErrorCreateContract)?;
        check_field_types(&fields, &code.fields).map_err(|_| VmError::SerdeErrorCreateContract)?;

        let asset = self.cur().balance_mut()?.take_approved().total()?;
        let code_hash = code
            .code_hash()
            .map_err(|_| VmError::SerdeErrorCreateContract)?;
        let id = self.next_contract_id();
        self.world_mut()?.create_contract(
            id,
            ContractRecord {
                code,
                code_hash,
                fields,
                asset,
            },
        );
        Ok(())
    }

    /// `hash(first_input_ref ‖ nonce)`, the nonce counting contracts created
    /// by this transaction.
    fn next_contract_id(&mut self) -> ContractId {
        let mut buf = match &self.tx.first_input {
            Some(input_ref) => input_ref.serialization(),
            None => self.tx.tx_id.as_bytes().to_vec(),
        };
        codec::encode_varint(self.contracts_created, &mut buf);
        self.contracts_created += 1;
        crypto::blake2b256(&buf)
    }

    fn op_destroy_contract(&mut self) -> VmResult {
        let id = contract_id_from_bytes(&self.cur().pop_bytes()?)?;
        let refund_to = self.cur().pop_address()?;
        if !refund_to.is_asset() {
            return Err(VmError::InvalidType);
        }
        // only the contract itself may trigger its destruction
        if self.current_contract_id()? != id {
            return Err(VmError::ContractNotFound);
        }
        let lockup = LockupScript::P2c(id);
        let residual = self.cur().balance_mut()?.remaining.take_entry(&lockup);
        if let Some(residual) = residual {
            self.output_balances.add_alf(&refund_to, residual.alf)?;
            for (token_id, amount) in residual.tokens {
                if !amount.is_zero() {
                    self.output_balances.add_token(&refund_to, token_id, amount)?;
                }
            }
        }
        self.world_mut()?.destroy_contract(&id);
        if let Some(&idx) = self.loaded.get(&id) {
            self.objs[idx].dirty = false;
        }
        Ok(())
    }

    fn op_issue_token(&mut self) -> VmResult {
        let amount = self.cur().pop_u256()?;
        let id = self.current_contract_id()?;
        if !self.cur().is_payable() {
            return Err(VmError::NonPayableFrame);
        }
        if self.token_issued {
            return Err(VmError::InvalidIssueToken);
        }
        self.token_issued = true;
        // the issued token's id is the issuing contract's id
        self.output_balances
            .add_token(&LockupScript::P2c(id), id, amount)
    }

    /* ----------------------------- completion ----------------------------- */

    /// Turn the accumulator into transaction outputs and write pending
    /// contract updates through to the world state.
    fn finalize(&mut self) -> VmResult<Vec<TxOutput>> {
        for idx in 0..self.objs.len() {
            if !self.objs[idx].dirty {
                continue;
            }
            if let Some(id) = self.objs[idx].address {
                let fields = self.objs[idx].fields.clone();
                let world = self.world_mut()?;
                if world.contract_exists(&id) {
                    world.update_contract_fields(&id, fields);
                }
            }
        }

        let balances = std::mem::take(&mut self.output_balances);
        let mut outputs = vec![];
        for (lockup, balance) in balances.iter() {
            if balance.is_empty() {
                continue;
            }
            let tokens: Vec<(TokenId, U256)> = balance
                .tokens
                .iter()
                .filter(|(_, amount)| !amount.is_zero())
                .map(|(id, amount)| (*id, *amount))
                .collect();
            match lockup {
                LockupScript::P2c(id) => {
                    let stored = crate::vm::balance::BalancesPerLockup {
                        alf: balance.alf,
                        tokens: tokens.iter().cloned().collect(),
                    };
                    let world = self.world_mut()?;
                    if world.contract_exists(id) {
                        world.set_contract_asset(id, stored);
                    }
                    outputs.push(TxOutput::Contract(ContractOutput {
                        amount: balance.alf,
                        lockup: lockup.clone(),
                        tokens,
                    }));
                }
                _ => outputs.push(TxOutput::Asset(AssetOutput {
                    amount: balance.alf,
                    lockup: lockup.clone(),
                    lock_time: 0,
                    tokens,
                    additional_data: Bytes::new(),
                })),
            }
        }
        Ok(outputs)
    }
}

fn check_field_types(fields: &[Val], types: &[crate::vm::value::Type]) -> VmResult {
    if fields.len() != types.len() {
        return Err(VmError::InvalidType);
    }
    for (field, ty) in fields.iter().zip(types) {
        if field.type_of() != *ty {
            return Err(VmError::InvalidType);
        }
    }
    Ok(())
}

fn contract_id_from_bytes(bytes: &[u8]) -> VmResult<ContractId> {
    if bytes.len() != 32 {
        return Err(VmError::InvalidType);
    }
    Ok(H256::from_slice(bytes))
}

fn token_id_from_bytes(bytes: &[u8]) -> VmResult<TokenId> {
    if bytes.len() != 32 {
        return Err(VmError::InvalidTokenId);
    }
    Ok(H256::from_slice(bytes))
}

fn shift_left(value: U256, count: U256) -> U256 {
    if count >= U256::from(256u16) {
        U256::zero()
    } else {
        value << count.as_usize()
    }
}

fn shift_right(value: U256, count: U256) -> U256 {
    if count >= U256::from(256u16) {
        U256::zero()
    } else {
        value >> count.as_usize()
    }
}

/// Run a transaction script against the world state, committing on success
/// and rolling every pending write back on abort. This is the entry point
/// block execution uses.
pub fn execute_tx_script(
    world: &mut dyn WorldState,
    block: BlockEnv,
    tx: TxEnv,
    gas_amount: u64,
    script: &StatefulScript,
    fields: Vec<Val>,
    args: Vec<Val>,
    input_balances: Balances,
) -> anyhow::Result<ScriptResult> {
    world.checkpoint();
    let outcome = {
        let mut runtime = Runtime::stateful(&mut *world, block, tx, gas_amount);
        match runtime.run_stateful_script(script, fields, args, input_balances) {
            Ok(result) => Ok(result),
            Err(err) => Err((err, runtime.abort_context())),
        }
    };
    match outcome {
        Ok(result) => {
            world.commit()?;
            Ok(result)
        }
        Err((err, (opcode, pc, depth))) => {
            world.rollback()?;
            Err(anyhow::anyhow!(
                "script aborted: {} (opcode {:#04x}, pc {}, frame depth {})",
                err,
                opcode,
                pc,
                depth
            ))
        }
    }
}
