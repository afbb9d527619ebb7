//! In-memory storage implementation for testing

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::traits::*;
use crate::types::*;

#[derive(Debug, Default)]
struct Tables {
    config: Option<MatchingConfig>,
    statements: BTreeMap<StatementId, StatementRecord>,
    ledger: BTreeMap<LedgerId, LedgerRecord>,
    links: HashMap<Uuid, MatchLink>,
    aliases: HashMap<Uuid, AliasRule>,
}

/// In-memory storage implementation for testing and development
///
/// Clones share the same tables. A batch commit holds the write lock for its
/// whole duration and works on a copy, so it is all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStorage {
    /// Create a new, empty memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory storage instance with an active configuration
    pub fn with_config(config: MatchingConfig) -> Self {
        let storage = Self::new();
        if let Ok(mut tables) = storage.tables.write() {
            tables.config = Some(config);
        }
        storage
    }

    /// Ingest a statement line
    pub fn add_statement(&self, statement: StatementRecord) -> ReconResult<()> {
        self.write()?.statements.insert(statement.id, statement);
        Ok(())
    }

    /// Ingest a ledger record
    pub fn add_ledger_record(&self, record: LedgerRecord) -> ReconResult<()> {
        self.write()?.ledger.insert(record.id, record);
        Ok(())
    }

    /// Delete a ledger record, leaving any link that points to it in place
    pub fn remove_ledger_record(&self, ledger_id: LedgerId) -> ReconResult<()> {
        self.write()?
            .ledger
            .remove(&ledger_id)
            .map(|_| ())
            .ok_or_else(|| ReconError::NotFound(format!("ledger record {}", ledger_id)))
    }

    /// Import a link as-is, without version or invariant checks
    ///
    /// Meant for loading legacy data, which may already violate the 1-to-1
    /// invariant. A committed link claims its ledger record's backref only
    /// when no other statement line holds it yet.
    pub fn seed_link(&self, mut link: MatchLink) -> ReconResult<()> {
        if link.version == 0 {
            link.version = 1;
        }
        let mut tables = self.write()?;
        if let Some(ledger_id) = link.committed_ledger_id() {
            if let Some(record) = tables.ledger.get_mut(&ledger_id) {
                if record.linked_statement_id.is_none() {
                    record.linked_statement_id = Some(link.statement_id);
                }
            }
        }
        tables.links.insert(link.id, link);
        Ok(())
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) -> ReconResult<()> {
        *self.write()? = Tables::default();
        Ok(())
    }

    fn read(&self) -> ReconResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ReconError::Storage("memory storage lock poisoned".to_string()))
    }

    fn write(&self) -> ReconResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ReconError::Storage("memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl ReconciliationStorage for MemoryStorage {
    async fn active_config(&self) -> ReconResult<Option<MatchingConfig>> {
        Ok(self.read()?.config.clone())
    }

    async fn save_config(&self, config: &MatchingConfig) -> ReconResult<()> {
        self.write()?.config = Some(config.clone());
        Ok(())
    }

    async fn statements_for_period(&self, period: &Period) -> ReconResult<Vec<StatementRecord>> {
        Ok(self
            .read()?
            .statements
            .values()
            .filter(|s| s.period() == *period)
            .cloned()
            .collect())
    }

    async fn get_statement(
        &self,
        statement_id: StatementId,
    ) -> ReconResult<Option<StatementRecord>> {
        Ok(self.read()?.statements.get(&statement_id).cloned())
    }

    async fn ledger_records_between(
        &self,
        account_id: AccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconResult<Vec<LedgerRecord>> {
        Ok(self
            .read()?
            .ledger
            .values()
            .filter(|r| r.account_id == account_id)
            .filter(|r| r.date.is_none_or(|d| d >= start && d <= end))
            .cloned()
            .collect())
    }

    async fn get_ledger_record(&self, ledger_id: LedgerId) -> ReconResult<Option<LedgerRecord>> {
        Ok(self.read()?.ledger.get(&ledger_id).cloned())
    }

    async fn links_for_period(&self, period: &Period) -> ReconResult<Vec<MatchLink>> {
        let mut links: Vec<MatchLink> = self
            .read()?
            .links
            .values()
            .filter(|l| l.period == *period)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.statement_id);
        Ok(links)
    }

    async fn get_link(&self, link_id: Uuid) -> ReconResult<Option<MatchLink>> {
        Ok(self.read()?.links.get(&link_id).cloned())
    }

    async fn link_for_statement(
        &self,
        statement_id: StatementId,
    ) -> ReconResult<Option<MatchLink>> {
        Ok(self
            .read()?
            .links
            .values()
            .find(|l| l.statement_id == statement_id)
            .cloned())
    }

    async fn committed_link_for_ledger(
        &self,
        ledger_id: LedgerId,
    ) -> ReconResult<Option<MatchLink>> {
        let tables = self.read()?;
        let mut holders: Vec<&MatchLink> = tables
            .links
            .values()
            .filter(|l| l.committed_ledger_id() == Some(ledger_id))
            .collect();
        holders.sort_by_key(|l| l.statement_id);
        Ok(holders.first().map(|l| (*l).clone()))
    }

    async fn committed_links_for_ledgers(
        &self,
        ledger_ids: &[LedgerId],
    ) -> ReconResult<Vec<MatchLink>> {
        let wanted: BTreeSet<LedgerId> = ledger_ids.iter().copied().collect();
        let mut holders: Vec<MatchLink> = self
            .read()?
            .links
            .values()
            .filter(|l| l.committed_ledger_id().is_some_and(|id| wanted.contains(&id)))
            .cloned()
            .collect();
        holders.sort_by_key(|l| (l.ledger_id, l.statement_id));
        Ok(holders)
    }

    async fn commit_links(&self, changes: &[LinkChange]) -> ReconResult<Vec<MatchLink>> {
        let mut tables = self.write()?;
        let mut links = tables.links.clone();
        let mut ledger = tables.ledger.clone();
        let mut touched: BTreeSet<(LedgerId, StatementId)> = BTreeSet::new();
        let mut stored = Vec::with_capacity(changes.len());

        for change in changes {
            let link = &change.link;
            let current = links.get(&link.id);
            let found = current.map(|l| l.version);
            let previously_committed = current.and_then(|l| l.committed_ledger_id());

            let version_ok = match change.expected_version {
                None => {
                    found.is_none() && !links.values().any(|l| l.statement_id == link.statement_id)
                }
                Some(expected) => found == Some(expected),
            };
            if !version_ok {
                return Err(ReconError::ConcurrentModification {
                    link_id: link.id,
                    expected: change.expected_version,
                    found,
                });
            }

            if let Some(old) = previously_committed {
                if let Some(record) = ledger.get_mut(&old) {
                    if record.linked_statement_id == Some(link.statement_id) {
                        record.linked_statement_id = None;
                    }
                }
            }

            let mut next = link.clone();
            next.version = change.expected_version.map_or(1, |v| v + 1);
            if let Some(ledger_id) = next.committed_ledger_id() {
                touched.insert((ledger_id, next.statement_id));
            }
            links.insert(next.id, next.clone());
            stored.push(next);
        }

        for (ledger_id, statement_id) in touched {
            let holders: Vec<StatementId> = links
                .values()
                .filter(|l| l.committed_ledger_id() == Some(ledger_id))
                .map(|l| l.statement_id)
                .collect();
            if !holders.contains(&statement_id) {
                continue;
            }
            if let Some(other) = holders.iter().find(|s| **s != statement_id) {
                return Err(ReconError::InvariantViolation {
                    ledger_id,
                    statement_id,
                    existing_statement_id: *other,
                });
            }
            if let Some(record) = ledger.get_mut(&ledger_id) {
                record.linked_statement_id = Some(statement_id);
            }
        }

        tables.links = links;
        tables.ledger = ledger;
        Ok(stored)
    }

    async fn list_aliases(&self, account_id: AccountId) -> ReconResult<Vec<AliasRule>> {
        let mut aliases: Vec<AliasRule> = self
            .read()?
            .aliases
            .values()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect();
        aliases.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(aliases)
    }

    async fn get_alias(&self, alias_id: Uuid) -> ReconResult<Option<AliasRule>> {
        Ok(self.read()?.aliases.get(&alias_id).cloned())
    }

    async fn save_alias(&self, alias: &AliasRule) -> ReconResult<()> {
        self.write()?.aliases.insert(alias.id, alias.clone());
        Ok(())
    }

    async fn delete_alias(&self, alias_id: Uuid) -> ReconResult<()> {
        if self.write()?.aliases.remove(&alias_id).is_some() {
            Ok(())
        } else {
            Err(ReconError::NotFound(format!("alias {}", alias_id)))
        }
    }
}

#[async_trait]
impl LedgerMaintenance for MemoryStorage {
    async fn find_free_ledger_record(
        &self,
        account_id: AccountId,
        date: NaiveDate,
        amount: &BigDecimal,
        description: &str,
        reference: Option<&str>,
    ) -> ReconResult<Option<LedgerRecord>> {
        let reference = reference.unwrap_or_default().trim();
        let tables = self.read()?;
        let committed: BTreeSet<LedgerId> = tables
            .links
            .values()
            .filter_map(MatchLink::committed_ledger_id)
            .collect();
        Ok(tables
            .ledger
            .values()
            .find(|r| {
                r.account_id == account_id
                    && r.date == Some(date)
                    && r.amount.as_ref() == Some(amount)
                    && r.description.trim() == description.trim()
                    && r.reference.as_deref().unwrap_or_default().trim() == reference
                    && r.linked_statement_id.is_none()
                    && !committed.contains(&r.id)
            })
            .cloned())
    }

    async fn create_ledger_record(&self, record: &NewLedgerRecord) -> ReconResult<LedgerRecord> {
        let mut tables = self.write()?;
        let id = tables.ledger.keys().next_back().map_or(1, |last| last + 1);
        let created = LedgerRecord {
            id,
            account_id: record.account_id,
            date: Some(record.date),
            description: record.description.clone(),
            reference: record.reference.clone(),
            amount: Some(record.amount.clone()),
            foreign_amount: record.foreign_amount.clone(),
            fx_rate: record.fx_rate.clone(),
            third_party_id: None,
            cost_center_id: None,
            concept_id: None,
            linked_statement_id: None,
        };
        tables.ledger.insert(id, created.clone());
        Ok(created)
    }
}
