//! Developer key lifecycle.
//!
//! Creation, updates and destruction run the same fixed sequence of steps
//! around the store write: validate, fill in defaults, persist, then clear
//! caches, invalidate tokens and schedule tool propagation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::cache::DeveloperKeyCache;
use super::error::ServiceError;
use super::special_keys::SpecialKeyRegistry;
use super::store::Stores;
use super::token::generate_rsa_jwk_pair;
use super::tool_lifecycle::{ToolAction, ToolLifecycleCoordinator, ToolManagementDispatch};
use crate::models::developer_key::DEFAULT_KEY_NAME;
use crate::models::{
    Account, BindingState, DeveloperKey, DeveloperKeyAccountBinding, DeveloperKeyId,
    KeyWorkflowState, NewDeveloperKey, ScopeRegistry, ShardId,
};

pub const RSA_KEY_BITS: usize = 2048;

/// Give the key a fresh RSA public JWK, returning the private half. Keys that
/// already have a public JWK are left alone unless `overwrite` is set.
pub fn generate_rsa_keypair(
    key: &mut DeveloperKey,
    overwrite: bool,
    bits: usize,
) -> Result<Option<Value>, ServiceError> {
    if key.public_jwk.is_some() && !overwrite {
        return Ok(None);
    }
    let (private_jwk, public_jwk) = generate_rsa_jwk_pair(bits)?;
    key.public_jwk = Some(public_jwk);
    Ok(Some(private_jwk))
}

pub struct DeveloperKeyService {
    stores: Stores,
    cache: Arc<DeveloperKeyCache>,
    tools: Arc<ToolLifecycleCoordinator>,
    special_keys: Arc<SpecialKeyRegistry>,
    scopes: Arc<ScopeRegistry>,
    home_shard: ShardId,
}

impl DeveloperKeyService {
    pub fn new(
        stores: Stores,
        cache: Arc<DeveloperKeyCache>,
        tools: Arc<ToolLifecycleCoordinator>,
        special_keys: Arc<SpecialKeyRegistry>,
        scopes: Arc<ScopeRegistry>,
        home_shard: ShardId,
    ) -> Self {
        Self {
            stores,
            cache,
            tools,
            special_keys,
            scopes,
            home_shard,
        }
    }

    pub fn cache(&self) -> &Arc<DeveloperKeyCache> {
        &self.cache
    }

    pub fn tools(&self) -> &Arc<ToolLifecycleCoordinator> {
        &self.tools
    }

    /// Validate and persist a new key, then give its owner account a default
    /// binding.
    pub async fn create(&self, params: NewDeveloperKey) -> Result<DeveloperKey, ServiceError> {
        let mut key = DeveloperKey::new(params, self.home_shard);
        key.validate(&self.scopes)?;

        key.generate_api_key(false);
        key.auto_expire_tokens = !key.force_token_reuse;
        key.visible = !key.is_site_admin_owned();
        self.before_save(&mut key).await?;

        let key = self.stores.developer_keys.insert_key(key).await?;

        let owner = self.owner_account(&key).await?;
        self.stores
            .bindings
            .create_binding(DeveloperKeyAccountBinding::new(key.id, owner.id))
            .await?;
        self.cache.clear(&key).await;

        tracing::info!(
            developer_key_id = key.global_id(),
            account_id = ?key.account_id,
            lti = key.is_lti_key(),
            ims_registration = key.has_ims_registration(),
            "Created developer key"
        );
        Ok(key)
    }

    /// Validate and persist changes to an existing key.
    pub async fn save(&self, key: &mut DeveloperKey) -> Result<(), ServiceError> {
        let previous = self.find_stored(key.id).await?;
        self.update(key, &previous).await
    }

    pub async fn activate(&self, key: &mut DeveloperKey) -> Result<(), ServiceError> {
        key.activate()?;
        self.save(key).await
    }

    pub async fn deactivate(&self, key: &mut DeveloperKey) -> Result<(), ServiceError> {
        key.deactivate()?;
        self.save(key).await
    }

    /// Logically delete the key. Deleting an already deleted key succeeds
    /// without touching anything.
    pub async fn destroy(&self, key: &mut DeveloperKey) -> Result<bool, ServiceError> {
        if key.is_deleted() {
            return Ok(true);
        }

        let previous = self.find_stored(key.id).await?;
        key.workflow_state = KeyWorkflowState::Deleted;
        self.protect_default_key(key).await?;
        self.destroy_associated_records(key).await?;
        self.update(key, &previous).await?;
        Ok(true)
    }

    /// Remove the key and its dependent records for good.
    pub async fn destroy_permanently(&self, mut key: DeveloperKey) -> Result<(), ServiceError> {
        self.destroy_associated_records(&mut key).await?;
        self.stores.developer_keys.delete_key(key.id).await?;
        self.cache.clear(&key).await;
        tracing::info!(
            developer_key_id = key.global_id(),
            "Permanently destroyed developer key"
        );
        Ok(())
    }

    /// Destroy the key's dependents in order: tool configuration, IMS
    /// registration, then account bindings.
    pub async fn destroy_associated_records(
        &self,
        key: &mut DeveloperKey,
    ) -> Result<usize, ServiceError> {
        match key.tool_configuration.take() {
            Some(source) if source.is_ims_registration() => tracing::debug!(
                developer_key_id = key.global_id(),
                "Destroyed tool configuration and IMS registration"
            ),
            Some(_) => tracing::debug!(
                developer_key_id = key.global_id(),
                "Destroyed tool configuration"
            ),
            None => {}
        }

        let removed = self
            .stores
            .bindings
            .delete_bindings_for_key(key.id)
            .await?;
        self.cache.clear_site_admin_binding(key).await;
        tracing::debug!(
            developer_key_id = key.global_id(),
            removed,
            "Destroyed developer key account bindings"
        );
        Ok(removed)
    }

    /// Set the key's binding on `account`, creating it when missing, and
    /// propagate the new state to installed tools.
    pub async fn set_binding_state(
        &self,
        key: &DeveloperKey,
        account: &Account,
        state: BindingState,
    ) -> Result<DeveloperKeyAccountBinding, ServiceError> {
        let binding = match self.stores.bindings.find_binding(key.id, account.id).await? {
            Some(mut binding) => {
                binding.workflow_state = state;
                binding.updated_at = Utc::now();
                self.stores.bindings.save_binding(&binding).await?;
                binding
            }
            None => {
                self.stores
                    .bindings
                    .create_binding(DeveloperKeyAccountBinding::new(key.id, account.id).with_state(state))
                    .await?
            }
        };

        if account.site_admin {
            self.cache.clear_site_admin_binding(key).await;
        }

        tracing::info!(
            developer_key_id = key.global_id(),
            account_id = account.id,
            state = state.as_str(),
            "Updated developer key account binding"
        );

        match state {
            BindingState::On => self.enable_external_tools(key, Some(account)),
            BindingState::Off => self.disable_external_tools(key, Some(account)),
            BindingState::Allow => self.restore_external_tools(key, Some(account)),
        };
        Ok(binding)
    }

    pub fn enable_external_tools(
        &self,
        key: &DeveloperKey,
        account: Option<&Account>,
    ) -> ToolManagementDispatch {
        self.tools.manage(key, ToolAction::Enable, account)
    }

    pub fn disable_external_tools(
        &self,
        key: &DeveloperKey,
        account: Option<&Account>,
    ) -> ToolManagementDispatch {
        self.tools.manage(key, ToolAction::Disable, account)
    }

    pub fn restore_external_tools(
        &self,
        key: &DeveloperKey,
        account: Option<&Account>,
    ) -> ToolManagementDispatch {
        self.tools.manage(key, ToolAction::Restore, account)
    }

    /// Re-sync installed tools with the key's configuration, scoped to the
    /// owning account.
    pub async fn update_external_tools(
        &self,
        key: &DeveloperKey,
    ) -> Result<ToolManagementDispatch, ServiceError> {
        let account = self.owning_account(key).await?;
        Ok(self.tools.manage(key, ToolAction::Update, account.as_ref()))
    }

    /// The `User-Generated` key every user token without a key falls back to.
    pub async fn default_key(
        &self,
        create_if_missing: bool,
    ) -> Result<Option<DeveloperKey>, ServiceError> {
        self.get_special_key(DEFAULT_KEY_NAME, create_if_missing)
            .await
    }

    /// Find the named special key, creating it turned on everywhere when it
    /// is missing and `create_if_missing` is set.
    pub async fn get_special_key(
        &self,
        name: &str,
        create_if_missing: bool,
    ) -> Result<Option<DeveloperKey>, ServiceError> {
        if let Some(id) = self.special_keys.lookup(name).await? {
            if let Some(key) = self.stores.developer_keys.find_key(id).await? {
                self.special_keys.remember(name, id);
                return Ok(Some(key));
            }
            self.special_keys.forget(name);
        }

        if !create_if_missing {
            return Ok(None);
        }

        let mut key = self
            .create(NewDeveloperKey {
                name: Some(name.to_string()),
                ..Default::default()
            })
            .await?;

        for mut binding in self.stores.bindings.bindings_for_key(key.id).await? {
            binding.workflow_state = BindingState::On;
            self.stores.bindings.save_binding(&binding).await?;
        }
        self.cache.clear_site_admin_binding(&key).await;

        key.auto_expire_tokens = false;
        self.save(&mut key).await?;
        self.special_keys.register(name, key.id).await?;
        Ok(Some(key))
    }

    pub async fn find_cached(&self, id: DeveloperKeyId) -> Result<DeveloperKey, ServiceError> {
        self.cache.find_cached(id).await
    }

    pub async fn by_cached_vendor_code(
        &self,
        vendor_code: &str,
    ) -> Result<Vec<DeveloperKey>, ServiceError> {
        self.cache.by_cached_vendor_code(vendor_code).await
    }

    pub async fn last_used_at(
        &self,
        key: &DeveloperKey,
    ) -> Result<Option<DateTime<Utc>>, ServiceError> {
        self.stores.access_tokens.last_used_at(key.id).await
    }

    pub async fn invalidate_access_tokens(&self, key: &DeveloperKey) -> Result<usize, ServiceError> {
        let destroyed = self
            .stores
            .access_tokens
            .destroy_tokens_for_key(key.id)
            .await?;
        tracing::info!(
            developer_key_id = key.global_id(),
            destroyed,
            "Invalidated developer key access tokens"
        );
        Ok(destroyed)
    }

    /// The owning account, or site admin for keys without one.
    pub async fn owner_account(&self, key: &DeveloperKey) -> Result<Account, ServiceError> {
        match self.owning_account(key).await? {
            Some(account) => Ok(account),
            None => self.stores.accounts.site_admin().await,
        }
    }

    async fn owning_account(&self, key: &DeveloperKey) -> Result<Option<Account>, ServiceError> {
        let Some(account_id) = key.account_id else {
            return Ok(None);
        };
        self.stores
            .accounts
            .find_account(account_id)
            .await?
            .map(Some)
            .ok_or_else(|| ServiceError::NotFound(format!("Account {}", account_id)))
    }

    async fn find_stored(&self, id: DeveloperKeyId) -> Result<DeveloperKey, ServiceError> {
        self.stores
            .developer_keys
            .find_key(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("DeveloperKey {}", id)))
    }

    async fn update(
        &self,
        key: &mut DeveloperKey,
        previous: &DeveloperKey,
    ) -> Result<(), ServiceError> {
        key.validate(&self.scopes)?;
        self.before_save(key).await?;
        self.stores.developer_keys.update_key(key).await?;

        self.cache.clear(key).await;
        if previous.vendor_code != key.vendor_code {
            self.cache.clear(previous).await;
        }

        if key.scopes_removed_since(previous) {
            self.invalidate_access_tokens(key).await?;
        }

        let newly_deleted = key.is_deleted() && !previous.is_deleted();
        if newly_deleted && previous.tool_configuration.is_some() {
            // The cascade has already dropped the configuration from `key`.
            let mut snapshot = key.clone();
            snapshot.tool_configuration = previous.tool_configuration.clone();
            let account = self.owning_account(&snapshot).await?;
            self.tools
                .manage(&snapshot, ToolAction::Destroy, account.as_ref());
        }

        tracing::debug!(
            developer_key_id = key.global_id(),
            workflow_state = key.workflow_state.as_str(),
            "Saved developer key"
        );
        Ok(())
    }

    async fn before_save(&self, key: &mut DeveloperKey) -> Result<(), ServiceError> {
        key.prepare_for_save();
        self.protect_default_key(key).await?;

        if key.root_account_id.is_none() {
            key.root_account_id = match self.owning_account(key).await? {
                Some(account) => Some(account.resolved_root_account_id()),
                None => {
                    let site_admin = self.stores.accounts.site_admin().await?;
                    (site_admin.shard_id == self.home_shard).then_some(site_admin.id)
                }
            };
        }
        Ok(())
    }

    async fn protect_default_key(&self, key: &DeveloperKey) -> Result<(), ServiceError> {
        if key.is_active() || key.id == 0 {
            return Ok(());
        }
        if self.special_keys.lookup(DEFAULT_KEY_NAME).await? == Some(key.id) {
            tracing::warn!(
                developer_key_id = key.global_id(),
                workflow_state = key.workflow_state.as_str(),
                "Refusing to move the default developer key out of active"
            );
            return Err(ServiceError::ProtectedKey);
        }
        Ok(())
    }
}
