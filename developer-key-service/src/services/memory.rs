//! In-memory implementation of every store trait, backed by `DashMap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use super::error::ServiceError;
use super::store::{
    AccessTokenStore, AccountStore, BindingStore, DeveloperKeyStore, ExternalToolStore,
    SettingsStore, ToolScope,
};
use crate::models::{
    AccessToken, Account, AccountId, ContextExternalTool, DeveloperKey,
    DeveloperKeyAccountBinding, DeveloperKeyId, ShardId, ToolId, ToolWorkflowState,
};

pub struct MemoryStore {
    site_admin_id: AccountId,
    accounts: DashMap<AccountId, Account>,
    developer_keys: DashMap<DeveloperKeyId, DeveloperKey>,
    bindings: DashMap<(DeveloperKeyId, AccountId), DeveloperKeyAccountBinding>,
    tools: DashMap<ToolId, ContextExternalTool>,
    access_tokens: DashMap<i64, AccessToken>,
    settings: DashMap<String, String>,
    next_key_id: AtomicI64,
    next_binding_id: AtomicI64,
    next_tool_id: AtomicI64,
    next_token_id: AtomicI64,
}

impl MemoryStore {
    pub fn new(site_admin: Account) -> Self {
        let accounts = DashMap::new();
        let site_admin_id = site_admin.id;
        accounts.insert(site_admin.id, site_admin);

        Self {
            site_admin_id,
            accounts,
            developer_keys: DashMap::new(),
            bindings: DashMap::new(),
            tools: DashMap::new(),
            access_tokens: DashMap::new(),
            settings: DashMap::new(),
            next_key_id: AtomicI64::new(1),
            next_binding_id: AtomicI64::new(1),
            next_tool_id: AtomicI64::new(1),
            next_token_id: AtomicI64::new(1),
        }
    }

    pub fn insert_account(&self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    pub fn insert_access_token(&self, mut token: AccessToken) -> AccessToken {
        token.id = self.next_token_id.fetch_add(1, Ordering::SeqCst);
        self.access_tokens.insert(token.id, token.clone());
        token
    }

    pub fn access_token_count(&self, developer_key_id: DeveloperKeyId) -> usize {
        self.access_tokens
            .iter()
            .filter(|token| token.developer_key_id == developer_key_id)
            .count()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn find_account(&self, id: AccountId) -> Result<Option<Account>, ServiceError> {
        Ok(self.accounts.get(&id).map(|account| account.value().clone()))
    }

    async fn site_admin(&self) -> Result<Account, ServiceError> {
        self.accounts
            .get(&self.site_admin_id)
            .map(|account| account.value().clone())
            .ok_or_else(|| ServiceError::NotFound("Site admin account".to_string()))
    }

    async fn root_accounts_on_shard(
        &self,
        shard_id: ShardId,
    ) -> Result<Vec<Account>, ServiceError> {
        let mut roots: Vec<Account> = self
            .accounts
            .iter()
            .filter(|account| account.shard_id == shard_id && account.is_root())
            .map(|account| account.value().clone())
            .collect();
        roots.sort_by_key(|account| account.id);
        Ok(roots)
    }
}

#[async_trait]
impl DeveloperKeyStore for MemoryStore {
    async fn insert_key(&self, mut key: DeveloperKey) -> Result<DeveloperKey, ServiceError> {
        key.id = self.next_key_id.fetch_add(1, Ordering::SeqCst);
        self.developer_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn update_key(&self, key: &DeveloperKey) -> Result<(), ServiceError> {
        match self.developer_keys.get_mut(&key.id) {
            Some(mut stored) => {
                *stored = key.clone();
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!("DeveloperKey {}", key.id))),
        }
    }

    async fn find_key(&self, id: DeveloperKeyId) -> Result<Option<DeveloperKey>, ServiceError> {
        Ok(self.developer_keys.get(&id).map(|key| key.value().clone()))
    }

    async fn find_keys_by_vendor_code(
        &self,
        vendor_code: &str,
    ) -> Result<Vec<DeveloperKey>, ServiceError> {
        let mut keys: Vec<DeveloperKey> = self
            .developer_keys
            .iter()
            .filter(|key| key.vendor_code.as_deref() == Some(vendor_code))
            .map(|key| key.value().clone())
            .collect();
        keys.sort_by_key(|key| key.id);
        Ok(keys)
    }

    async fn delete_key(&self, id: DeveloperKeyId) -> Result<(), ServiceError> {
        self.developer_keys.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn create_binding(
        &self,
        mut binding: DeveloperKeyAccountBinding,
    ) -> Result<DeveloperKeyAccountBinding, ServiceError> {
        match self
            .bindings
            .entry((binding.developer_key_id, binding.account_id))
        {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "account {} already has a binding for developer key {}",
                binding.account_id, binding.developer_key_id
            ))),
            Entry::Vacant(slot) => {
                binding.id = self.next_binding_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(binding.clone());
                Ok(binding)
            }
        }
    }

    async fn save_binding(&self, binding: &DeveloperKeyAccountBinding) -> Result<(), ServiceError> {
        self.bindings
            .insert((binding.developer_key_id, binding.account_id), binding.clone());
        Ok(())
    }

    async fn find_binding(
        &self,
        developer_key_id: DeveloperKeyId,
        account_id: AccountId,
    ) -> Result<Option<DeveloperKeyAccountBinding>, ServiceError> {
        Ok(self
            .bindings
            .get(&(developer_key_id, account_id))
            .map(|binding| binding.value().clone()))
    }

    async fn find_in_account_priority(
        &self,
        account_ids: &[AccountId],
        developer_key_id: DeveloperKeyId,
        explicitly_set: bool,
    ) -> Result<Option<DeveloperKeyAccountBinding>, ServiceError> {
        let found = account_ids.iter().find_map(|account_id| {
            self.bindings
                .get(&(developer_key_id, *account_id))
                .filter(|binding| !explicitly_set || binding.is_explicitly_set())
                .map(|binding| binding.value().clone())
        });
        Ok(found)
    }

    async fn bindings_for_key(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<Vec<DeveloperKeyAccountBinding>, ServiceError> {
        let mut bindings: Vec<DeveloperKeyAccountBinding> = self
            .bindings
            .iter()
            .filter(|binding| binding.developer_key_id == developer_key_id)
            .map(|binding| binding.value().clone())
            .collect();
        bindings.sort_by_key(|binding| binding.id);
        Ok(bindings)
    }

    async fn delete_bindings_for_key(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<usize, ServiceError> {
        let before = self.bindings.len();
        self.bindings
            .retain(|(key_id, _), _| *key_id != developer_key_id);
        Ok(before - self.bindings.len())
    }
}

#[async_trait]
impl ExternalToolStore for MemoryStore {
    async fn insert_tool(
        &self,
        mut tool: ContextExternalTool,
    ) -> Result<ContextExternalTool, ServiceError> {
        tool.id = self.next_tool_id.fetch_add(1, Ordering::SeqCst);
        self.tools.insert(tool.id, tool.clone());
        Ok(tool)
    }

    async fn save_tool(&self, tool: &ContextExternalTool) -> Result<(), ServiceError> {
        self.tools.insert(tool.id, tool.clone());
        Ok(())
    }

    async fn find_tool(&self, id: ToolId) -> Result<Option<ContextExternalTool>, ServiceError> {
        Ok(self.tools.get(&id).map(|tool| tool.value().clone()))
    }

    async fn tool_ids_in_scope(
        &self,
        shard_id: ShardId,
        scope: &ToolScope,
    ) -> Result<Vec<ToolId>, ServiceError> {
        let mut ids: Vec<ToolId> = self
            .tools
            .iter()
            .filter(|tool| {
                tool.shard_id == shard_id
                    && tool.developer_key_id == scope.developer_key_id
                    && scope
                        .root_account_id
                        .map_or(true, |root_id| tool.root_account_id == root_id)
                    && scope.filter.matches(tool.workflow_state)
            })
            .map(|tool| tool.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn find_tools(&self, ids: &[ToolId]) -> Result<Vec<ContextExternalTool>, ServiceError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.tools.get(id).map(|tool| tool.value().clone()))
            .collect())
    }

    async fn set_tool_workflow_state(
        &self,
        ids: &[ToolId],
        state: ToolWorkflowState,
    ) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let mut updated = 0;
        for id in ids {
            if let Some(mut tool) = self.tools.get_mut(id) {
                tool.workflow_state = state;
                tool.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl AccessTokenStore for MemoryStore {
    async fn destroy_tokens_for_key(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<usize, ServiceError> {
        let before = self.access_tokens.len();
        self.access_tokens
            .retain(|_, token| token.developer_key_id != developer_key_id);
        Ok(before - self.access_tokens.len())
    }

    async fn last_used_at(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<Option<DateTime<Utc>>, ServiceError> {
        Ok(self
            .access_tokens
            .iter()
            .filter(|token| token.developer_key_id == developer_key_id)
            .filter_map(|token| token.last_used_at)
            .max())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, name: &str) -> Result<Option<String>, ServiceError> {
        Ok(self.settings.get(name).map(|value| value.value().clone()))
    }

    async fn set_setting(&self, name: &str, value: &str) -> Result<(), ServiceError> {
        self.settings.insert(name.to_string(), value.to_string());
        Ok(())
    }
}
