//! Key usability and authorization answers.

use std::sync::Arc;

use super::binding_resolver::BindingResolver;
use super::error::ServiceError;
use super::store::{AccountStore, SettingsStore};
use crate::config::TestClusterConfig;
use crate::models::{Account, Context, DeveloperKey};

/// Setting that turns on test cluster restrictions when present.
pub const TEST_CLUSTER_CHECKS_SETTING: &str = "dev_key_test_cluster_checks_enabled";

pub struct KeyAuthorizer {
    resolver: Arc<BindingResolver>,
    accounts: Arc<dyn AccountStore>,
    settings: Arc<dyn SettingsStore>,
    test_cluster: TestClusterConfig,
}

impl KeyAuthorizer {
    pub fn new(
        resolver: Arc<BindingResolver>,
        accounts: Arc<dyn AccountStore>,
        settings: Arc<dyn SettingsStore>,
        test_cluster: TestClusterConfig,
    ) -> Self {
        Self {
            resolver,
            accounts,
            settings,
            test_cluster,
        }
    }

    pub async fn test_cluster_checks_enabled(&self) -> Result<bool, ServiceError> {
        if self.test_cluster.checks_enabled {
            return Ok(true);
        }
        Ok(self
            .settings
            .get_setting(TEST_CLUSTER_CHECKS_SETTING)
            .await?
            .is_some_and(|value| !value.trim().is_empty()))
    }

    /// Active, and not a test-cluster-only key outside a test cluster.
    pub async fn usable(&self, key: &DeveloperKey) -> Result<bool, ServiceError> {
        if !key.is_active() {
            return Ok(false);
        }
        if key.test_cluster_only && !self.test_cluster.is_test_cluster {
            return Ok(!self.test_cluster_checks_enabled().await?);
        }
        Ok(true)
    }

    pub async fn usable_in_context(
        &self,
        key: &DeveloperKey,
        context: &Context,
    ) -> Result<bool, ServiceError> {
        if !self
            .resolver
            .binding_on_in_account(key, context.account())
            .await?
        {
            return Ok(false);
        }
        self.usable(key).await
    }

    /// Binding is on in `target`, and the key is either site admin owned or
    /// owned by `target` or one of its ancestors.
    pub async fn authorized_for_account(
        &self,
        key: &DeveloperKey,
        target: &Account,
    ) -> Result<bool, ServiceError> {
        if !self.resolver.binding_on_in_account(key, target).await? {
            return Ok(false);
        }
        let Some(owner_id) = key.account_id else {
            return Ok(true);
        };
        if target.id == owner_id {
            return Ok(true);
        }

        let chains = self.resolver.chains();
        let include_federated_parent = chains.include_federated_parent(target).await?;
        Ok(chains
            .chain_ids(target, include_federated_parent)
            .await?
            .contains(&owner_id))
    }

    pub async fn binding_on_in_account(
        &self,
        key: &DeveloperKey,
        account: &Account,
    ) -> Result<bool, ServiceError> {
        self.resolver.binding_on_in_account(key, account).await
    }

    /// The owning account, or site admin for site admin keys.
    pub async fn owner_account(&self, key: &DeveloperKey) -> Result<Account, ServiceError> {
        match key.account_id {
            Some(id) => self
                .accounts
                .find_account(id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Account {}", id))),
            None => self.accounts.site_admin().await,
        }
    }
}
