//! Account chain resolution.
//!
//! A chain runs closest-first: the account itself, its parent, and so on up
//! to the root. Federation members can extend it with the chain of their
//! federated parent.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use super::error::ServiceError;
use super::store::AccountStore;
use crate::models::{Account, AccountId};

pub struct AccountChainResolver {
    accounts: Arc<dyn AccountStore>,
    memo: Option<DashMap<(AccountId, bool), Arc<Vec<Account>>>>,
}

impl AccountChainResolver {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            accounts,
            memo: None,
        }
    }

    /// Resolver that remembers every chain it computes, keyed by account id
    /// and federation flag.
    pub fn memoized(accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            accounts,
            memo: Some(DashMap::new()),
        }
    }

    pub fn clear(&self) {
        if let Some(memo) = &self.memo {
            memo.clear();
        }
    }

    pub async fn chain(
        &self,
        account: &Account,
        include_federated_parent: bool,
    ) -> Result<Vec<Account>, ServiceError> {
        let memo_key = (account.id, include_federated_parent);
        if let Some(hit) = self
            .memo
            .as_ref()
            .and_then(|memo| memo.get(&memo_key).map(|chain| chain.value().clone()))
        {
            return Ok(hit.as_ref().clone());
        }

        let chain = self.compute(account, include_federated_parent).await?;

        if let Some(memo) = &self.memo {
            memo.insert(memo_key, Arc::new(chain.clone()));
        }
        Ok(chain)
    }

    pub async fn chain_ids(
        &self,
        account: &Account,
        include_federated_parent: bool,
    ) -> Result<Vec<AccountId>, ServiceError> {
        Ok(self
            .chain(account, include_federated_parent)
            .await?
            .into_iter()
            .map(|account| account.id)
            .collect())
    }

    pub async fn root_account(&self, account: &Account) -> Result<Account, ServiceError> {
        if account.is_root() {
            return Ok(account.clone());
        }
        let root_id = account.resolved_root_account_id();
        self.accounts
            .find_account(root_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Account {}", root_id)))
    }

    /// Whether chains for `account` should cross into the federated parent:
    /// true when its root account is not the primary settings authority.
    pub async fn include_federated_parent(&self, account: &Account) -> Result<bool, ServiceError> {
        let root = self.root_account(account).await?;
        Ok(!root.primary_settings_root_account)
    }

    async fn compute(
        &self,
        account: &Account,
        include_federated_parent: bool,
    ) -> Result<Vec<Account>, ServiceError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        self.walk_up(account.clone(), &mut chain, &mut seen).await?;

        if !include_federated_parent {
            return Ok(chain);
        }

        let federated_parent_id = chain
            .last()
            .filter(|root| root.is_root() && !root.primary_settings_root_account)
            .and_then(|root| root.federated_parent_account_id);

        if let Some(parent_id) = federated_parent_id.filter(|id| !seen.contains(id)) {
            match self.accounts.find_account(parent_id).await? {
                Some(parent) => self.walk_up(parent, &mut chain, &mut seen).await?,
                None => tracing::warn!(
                    account_id = account.id,
                    federated_parent_account_id = parent_id,
                    "Federated parent account not found"
                ),
            }
        }

        Ok(chain)
    }

    async fn walk_up(
        &self,
        start: Account,
        chain: &mut Vec<Account>,
        seen: &mut HashSet<AccountId>,
    ) -> Result<(), ServiceError> {
        if !seen.insert(start.id) {
            return Ok(());
        }
        let mut current = start;

        while let Some(parent_id) = current.parent_account_id {
            if !seen.insert(parent_id) {
                tracing::warn!(
                    account_id = current.id,
                    parent_account_id = parent_id,
                    "Cycle in account chain"
                );
                break;
            }
            let Some(parent) = self.accounts.find_account(parent_id).await? else {
                tracing::warn!(
                    account_id = current.id,
                    parent_account_id = parent_id,
                    "Parent account not found"
                );
                break;
            };
            chain.push(std::mem::replace(&mut current, parent));
        }

        chain.push(current);
        Ok(())
    }
}
