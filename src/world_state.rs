//! Contract storage behind the `WorldState` trait. The in-memory
//! implementation journals every mutation between `checkpoint` and
//! `commit`/`rollback` so a failed transaction unwinds atomically.

use std::collections::BTreeMap;

use anyhow::Result;
use ethereum_types::H256;

use crate::lockup::ContractId;
use crate::vm::balance::BalancesPerLockup;
use crate::vm::script::StatefulContract;
use crate::vm::value::Val;

/// A deployed contract as persisted between transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRecord {
    pub code: StatefulContract,
    pub code_hash: H256,
    pub fields: Vec<Val>,
    /// Assets the contract holds, drawn into a frame once per transaction.
    pub asset: BalancesPerLockup,
}

pub trait WorldState {
    fn load_contract(&self, id: &ContractId) -> Option<ContractRecord>;
    fn contract_exists(&self, id: &ContractId) -> bool;
    fn create_contract(&mut self, id: ContractId, record: ContractRecord);
    fn update_contract_fields(&mut self, id: &ContractId, fields: Vec<Val>);
    /// Move the stored asset out of the record, leaving it empty.
    fn take_contract_asset(&mut self, id: &ContractId) -> Option<BalancesPerLockup>;
    fn set_contract_asset(&mut self, id: &ContractId, asset: BalancesPerLockup);
    fn destroy_contract(&mut self, id: &ContractId) -> bool;

    fn checkpoint(&mut self);
    fn rollback(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
enum JournalEntry {
    ContractCreated {
        id: ContractId,
    },
    ContractDestroyed {
        id: ContractId,
        old_record: ContractRecord,
    },
    FieldsChange {
        id: ContractId,
        old_fields: Vec<Val>,
    },
    AssetChange {
        id: ContractId,
        old_asset: BalancesPerLockup,
    },
}

#[derive(Debug, Default)]
pub struct InMemoryWorldState {
    contracts: BTreeMap<ContractId, ContractRecord>,
    journal: Option<Vec<JournalEntry>>,
}

impl InMemoryWorldState {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_journal(&mut self, entry: JournalEntry) {
        if let Some(journal) = &mut self.journal {
            journal.push(entry);
        }
    }

    fn revert_journal_entry(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::ContractCreated { id } => {
                self.contracts.remove(&id);
            }
            JournalEntry::ContractDestroyed { id, old_record } => {
                self.contracts.insert(id, old_record);
            }
            JournalEntry::FieldsChange { id, old_fields } => {
                self.contracts.get_mut(&id).unwrap().fields = old_fields;
            }
            JournalEntry::AssetChange { id, old_asset } => {
                self.contracts.get_mut(&id).unwrap().asset = old_asset;
            }
        }
    }
}

impl WorldState for InMemoryWorldState {
    fn load_contract(&self, id: &ContractId) -> Option<ContractRecord> {
        self.contracts.get(id).cloned()
    }

    fn contract_exists(&self, id: &ContractId) -> bool {
        self.contracts.contains_key(id)
    }

    fn create_contract(&mut self, id: ContractId, record: ContractRecord) {
        self.push_journal(JournalEntry::ContractCreated { id });
        self.contracts.insert(id, record);
    }

    fn update_contract_fields(&mut self, id: &ContractId, fields: Vec<Val>) {
        let record = self.contracts.get_mut(id).unwrap();
        if record.fields != fields {
            let old_fields = std::mem::replace(&mut record.fields, fields);
            self.push_journal(JournalEntry::FieldsChange {
                id: *id,
                old_fields,
            });
        }
    }

    fn take_contract_asset(&mut self, id: &ContractId) -> Option<BalancesPerLockup> {
        let record = self.contracts.get_mut(id)?;
        let asset = std::mem::take(&mut record.asset);
        self.push_journal(JournalEntry::AssetChange {
            id: *id,
            old_asset: asset.clone(),
        });
        Some(asset)
    }

    fn set_contract_asset(&mut self, id: &ContractId, asset: BalancesPerLockup) {
        let record = self.contracts.get_mut(id).unwrap();
        let old_asset = std::mem::replace(&mut record.asset, asset);
        self.push_journal(JournalEntry::AssetChange {
            id: *id,
            old_asset,
        });
    }

    fn destroy_contract(&mut self, id: &ContractId) -> bool {
        match self.contracts.remove(id) {
            Some(old_record) => {
                self.push_journal(JournalEntry::ContractDestroyed {
                    id: *id,
                    old_record,
                });
                true
            }
            None => false,
        }
    }

    fn checkpoint(&mut self) {
        if self.journal.is_some() {
            panic!("checkpoint already exists");
        }
        self.journal = Some(Vec::new());
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.take() {
            for entry in journal.into_iter().rev() {
                self.revert_journal_entry(entry);
            }
            Ok(())
        } else {
            Err(anyhow::anyhow!("no checkpoint to rollback to"))
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.journal.is_none() {
            return Err(anyhow::anyhow!("no checkpoint to commit"));
        }
        self.journal = None;
        Ok(())
    }
}
