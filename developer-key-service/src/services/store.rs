//! Storage traits for the records the developer key subsystem reads and writes.
//!
//! Every trait is object safe so services hold `Arc<dyn ...>` handles and tests
//! swap in [`MemoryStore`](super::memory::MemoryStore).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::error::ServiceError;
use crate::models::{
    Account, AccountId, ContextExternalTool, DeveloperKey, DeveloperKeyAccountBinding,
    DeveloperKeyId, ShardId, ToolId, ToolWorkflowState,
};

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_account(&self, id: AccountId) -> Result<Option<Account>, ServiceError>;

    async fn site_admin(&self) -> Result<Account, ServiceError>;

    /// Root accounts living on `shard_id`, in id order.
    async fn root_accounts_on_shard(&self, shard_id: ShardId)
        -> Result<Vec<Account>, ServiceError>;
}

#[async_trait]
pub trait DeveloperKeyStore: Send + Sync {
    /// Persist a new key and return it with its assigned id.
    async fn insert_key(&self, key: DeveloperKey) -> Result<DeveloperKey, ServiceError>;

    async fn update_key(&self, key: &DeveloperKey) -> Result<(), ServiceError>;

    async fn find_key(&self, id: DeveloperKeyId) -> Result<Option<DeveloperKey>, ServiceError>;

    async fn find_keys_by_vendor_code(
        &self,
        vendor_code: &str,
    ) -> Result<Vec<DeveloperKey>, ServiceError>;

    async fn delete_key(&self, id: DeveloperKeyId) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Persist a new binding. Fails with `Conflict` when the account already
    /// has a binding for the key.
    async fn create_binding(
        &self,
        binding: DeveloperKeyAccountBinding,
    ) -> Result<DeveloperKeyAccountBinding, ServiceError>;

    async fn save_binding(&self, binding: &DeveloperKeyAccountBinding) -> Result<(), ServiceError>;

    async fn find_binding(
        &self,
        developer_key_id: DeveloperKeyId,
        account_id: AccountId,
    ) -> Result<Option<DeveloperKeyAccountBinding>, ServiceError>;

    /// First binding for the key found walking `account_ids` in order. With
    /// `explicitly_set` only `on` and `off` bindings are considered.
    async fn find_in_account_priority(
        &self,
        account_ids: &[AccountId],
        developer_key_id: DeveloperKeyId,
        explicitly_set: bool,
    ) -> Result<Option<DeveloperKeyAccountBinding>, ServiceError>;

    async fn bindings_for_key(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<Vec<DeveloperKeyAccountBinding>, ServiceError>;

    /// Delete every binding of the key, returning how many went away.
    async fn delete_bindings_for_key(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<usize, ServiceError>;
}

/// Which tools a scoped tool query selects by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStateFilter {
    NotDeleted,
    Active,
    Disabled,
}

impl ToolStateFilter {
    pub fn matches(&self, state: ToolWorkflowState) -> bool {
        match self {
            ToolStateFilter::NotDeleted => state != ToolWorkflowState::Deleted,
            ToolStateFilter::Active => state.is_active(),
            ToolStateFilter::Disabled => state == ToolWorkflowState::Disabled,
        }
    }
}

/// Tools of one developer key, optionally limited to one root account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolScope {
    pub developer_key_id: DeveloperKeyId,
    pub root_account_id: Option<AccountId>,
    pub filter: ToolStateFilter,
}

#[async_trait]
pub trait ExternalToolStore: Send + Sync {
    async fn insert_tool(&self, tool: ContextExternalTool)
        -> Result<ContextExternalTool, ServiceError>;

    async fn save_tool(&self, tool: &ContextExternalTool) -> Result<(), ServiceError>;

    async fn find_tool(&self, id: ToolId) -> Result<Option<ContextExternalTool>, ServiceError>;

    /// Ids of the tools on `shard_id` matching `scope`, ascending.
    async fn tool_ids_in_scope(
        &self,
        shard_id: ShardId,
        scope: &ToolScope,
    ) -> Result<Vec<ToolId>, ServiceError>;

    async fn find_tools(&self, ids: &[ToolId]) -> Result<Vec<ContextExternalTool>, ServiceError>;

    /// Move the given tools to `state` in one write.
    async fn set_tool_workflow_state(
        &self,
        ids: &[ToolId],
        state: ToolWorkflowState,
    ) -> Result<usize, ServiceError>;
}

#[async_trait]
pub trait AccessTokenStore: Send + Sync {
    /// Destroy the active access tokens issued through the key.
    async fn destroy_tokens_for_key(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<usize, ServiceError>;

    async fn last_used_at(
        &self,
        developer_key_id: DeveloperKeyId,
    ) -> Result<Option<DateTime<Utc>>, ServiceError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, name: &str) -> Result<Option<String>, ServiceError>;

    async fn set_setting(&self, name: &str, value: &str) -> Result<(), ServiceError>;
}

/// Bundle of store handles shared by the services.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub developer_keys: Arc<dyn DeveloperKeyStore>,
    pub bindings: Arc<dyn BindingStore>,
    pub tools: Arc<dyn ExternalToolStore>,
    pub access_tokens: Arc<dyn AccessTokenStore>,
    pub settings: Arc<dyn SettingsStore>,
}

impl Stores {
    /// Back every store with the same object.
    pub fn from_single<S>(store: Arc<S>) -> Self
    where
        S: AccountStore
            + DeveloperKeyStore
            + BindingStore
            + ExternalToolStore
            + AccessTokenStore
            + SettingsStore
            + 'static,
    {
        Self {
            accounts: store.clone(),
            developer_keys: store.clone(),
            bindings: store.clone(),
            tools: store.clone(),
            access_tokens: store.clone(),
            settings: store,
        }
    }
}
