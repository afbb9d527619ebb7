//! Alias rule management

use tracing::info;
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;
use crate::utils::validation::validate_alias;

/// Alias manager for account-scoped normalization rules
pub struct AliasManager<S: ReconciliationStorage> {
    storage: S,
}

impl<S: ReconciliationStorage> AliasManager<S> {
    /// Create a new alias manager
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// List the rules of an account
    pub async fn list(&self, account_id: AccountId) -> ReconResult<Vec<AliasRule>> {
        self.storage.list_aliases(account_id).await
    }

    /// Create a new rule
    pub async fn create(
        &self,
        account_id: AccountId,
        pattern: String,
        replacement: String,
    ) -> ReconResult<AliasRule> {
        validate_alias(&pattern, &replacement)?;
        let alias = AliasRule::new(account_id, pattern, replacement);
        self.storage.save_alias(&alias).await?;
        info!(alias_id = %alias.id, account_id, pattern = %alias.pattern, "Created alias rule");
        Ok(alias)
    }

    /// Change the pattern and replacement of a rule, keeping its account
    pub async fn update(
        &self,
        alias_id: Uuid,
        pattern: String,
        replacement: String,
    ) -> ReconResult<AliasRule> {
        validate_alias(&pattern, &replacement)?;
        let mut alias = self
            .storage
            .get_alias(alias_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("alias {}", alias_id)))?;

        alias.pattern = pattern;
        alias.replacement = replacement;
        self.storage.save_alias(&alias).await?;
        info!(alias_id = %alias.id, pattern = %alias.pattern, "Updated alias rule");
        Ok(alias)
    }

    /// Delete a rule
    pub async fn delete(&self, alias_id: Uuid) -> ReconResult<()> {
        self.storage.delete_alias(alias_id).await?;
        info!(alias_id = %alias_id, "Deleted alias rule");
        Ok(())
    }
}
