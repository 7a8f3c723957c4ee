//! Asset accounting during execution. A `Balances` ledger maps lockup
//! scripts to ALPH and token amounts; a `BalanceState` splits one frame's
//! ledger into `remaining` (spendable) and `approved` (pre-committed to
//! callees). All moves are checked: no negative balances, no silent overflow.

use std::collections::BTreeMap;

use ethereum_types::U256;

use crate::lockup::{LockupScript, TokenId};
use crate::vm::error::{VmError, VmResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancesPerLockup {
    pub alf: U256,
    pub tokens: BTreeMap<TokenId, U256>,
}

impl BalancesPerLockup {
    pub fn alf_only(amount: U256) -> Self {
        Self {
            alf: amount,
            tokens: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.alf.is_zero() && self.tokens.values().all(U256::is_zero)
    }

    pub fn add_alf(&mut self, amount: U256) -> VmResult {
        self.alf = self.alf.checked_add(amount).ok_or(VmError::BalanceOverflow)?;
        Ok(())
    }

    pub fn add_token(&mut self, token_id: TokenId, amount: U256) -> VmResult {
        let entry = self.tokens.entry(token_id).or_insert_with(U256::zero);
        *entry = entry.checked_add(amount).ok_or(VmError::BalanceOverflow)?;
        Ok(())
    }

    pub fn merge(&mut self, other: &BalancesPerLockup) -> VmResult {
        self.add_alf(other.alf)?;
        for (token_id, amount) in &other.tokens {
            self.add_token(*token_id, *amount)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Balances {
    entries: BTreeMap<LockupScript, BalancesPerLockup>,
}

impl Balances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_alf(lockup: LockupScript, amount: U256) -> Self {
        let mut balances = Self::new();
        balances.entries.insert(lockup, BalancesPerLockup::alf_only(amount));
        balances
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BalancesPerLockup::is_empty)
    }

    /// `None` when the address has no entry at all, which asset instructions
    /// report differently from a zero balance.
    pub fn alf_amount(&self, lockup: &LockupScript) -> Option<U256> {
        self.entries.get(lockup).map(|b| b.alf)
    }

    pub fn token_amount(&self, lockup: &LockupScript, token_id: &TokenId) -> Option<U256> {
        self.entries.get(lockup).and_then(|b| b.tokens.get(token_id)).copied()
    }

    pub fn add_alf(&mut self, lockup: &LockupScript, amount: U256) -> VmResult {
        self.entries.entry(lockup.clone()).or_default().add_alf(amount)
    }

    pub fn add_token(&mut self, lockup: &LockupScript, token_id: TokenId, amount: U256) -> VmResult {
        self.entries
            .entry(lockup.clone())
            .or_default()
            .add_token(token_id, amount)
    }

    pub fn use_alf(&mut self, lockup: &LockupScript, amount: U256) -> VmResult {
        let entry = self
            .entries
            .get_mut(lockup)
            .ok_or(VmError::NotEnoughBalance)?;
        entry.alf = entry
            .alf
            .checked_sub(amount)
            .ok_or(VmError::NotEnoughBalance)?;
        Ok(())
    }

    pub fn use_token(&mut self, lockup: &LockupScript, token_id: &TokenId, amount: U256) -> VmResult {
        let entry = self
            .entries
            .get_mut(lockup)
            .and_then(|b| b.tokens.get_mut(token_id))
            .ok_or(VmError::NotEnoughBalance)?;
        *entry = entry
            .checked_sub(amount)
            .ok_or(VmError::NotEnoughBalance)?;
        Ok(())
    }

    pub fn merge(&mut self, other: Balances) -> VmResult {
        for (lockup, balance) in other.entries {
            self.entries.entry(lockup).or_default().merge(&balance)?;
        }
        Ok(())
    }

    /// Collapse all entries into one pool, e.g. to fund a freshly created
    /// contract from every approver at once.
    pub fn total(&self) -> VmResult<BalancesPerLockup> {
        let mut total = BalancesPerLockup::default();
        for balance in self.entries.values() {
            total.merge(balance)?;
        }
        Ok(total)
    }

    pub fn take_entry(&mut self, lockup: &LockupScript) -> Option<BalancesPerLockup> {
        self.entries.remove(lockup)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LockupScript, &BalancesPerLockup)> {
        self.entries.iter()
    }
}

/// Per-frame ledger pair. Approvals move value from `remaining` to
/// `approved`; a call hands the approved pool to the callee, and whatever the
/// callee leaves behind flows back on clean return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceState {
    pub remaining: Balances,
    pub approved: Balances,
}

impl BalanceState {
    pub fn from_remaining(remaining: Balances) -> Self {
        Self {
            remaining,
            approved: Balances::new(),
        }
    }

    pub fn approve_alf(&mut self, lockup: &LockupScript, amount: U256) -> VmResult {
        self.remaining.use_alf(lockup, amount)?;
        self.approved.add_alf(lockup, amount)
    }

    pub fn approve_token(
        &mut self,
        lockup: &LockupScript,
        token_id: TokenId,
        amount: U256,
    ) -> VmResult {
        self.remaining.use_token(lockup, &token_id, amount)?;
        self.approved.add_token(lockup, token_id, amount)
    }

    pub fn take_approved(&mut self) -> Balances {
        std::mem::take(&mut self.approved)
    }

    /// Everything this frame still holds, spendable or approved-but-unused.
    pub fn drain(mut self) -> VmResult<Balances> {
        let approved = std::mem::take(&mut self.approved);
        self.remaining.merge(approved)?;
        Ok(self.remaining)
    }
}
