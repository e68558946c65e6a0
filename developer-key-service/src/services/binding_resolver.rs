//! Effective account binding of a developer key.
//!
//! Explicit `on`/`off` bindings set higher in the hierarchy win over anything
//! below them. Without an explicit binding, the closest binding of any state
//! applies.

use std::sync::Arc;

use super::account_chain::AccountChainResolver;
use super::cache::DeveloperKeyCache;
use super::error::ServiceError;
use super::store::BindingStore;
use crate::models::{Account, AccountId, DeveloperKey, DeveloperKeyAccountBinding};

pub struct BindingResolver {
    chains: Arc<AccountChainResolver>,
    bindings: Arc<dyn BindingStore>,
    cache: Arc<DeveloperKeyCache>,
}

impl BindingResolver {
    pub fn new(
        chains: Arc<AccountChainResolver>,
        bindings: Arc<dyn BindingStore>,
        cache: Arc<DeveloperKeyCache>,
    ) -> Self {
        Self {
            chains,
            bindings,
            cache,
        }
    }

    pub fn chains(&self) -> &Arc<AccountChainResolver> {
        &self.chains
    }

    pub async fn resolve(
        &self,
        key: &DeveloperKey,
        account: Option<&Account>,
    ) -> Result<Option<DeveloperKeyAccountBinding>, ServiceError> {
        let Some(account) = account else {
            return Ok(None);
        };

        if let Some(binding) = self.cache.find_site_admin_cached(key).await? {
            return Ok(Some(binding));
        }

        let include_federated_parent = self.chains.include_federated_parent(account).await?;
        let closest_first = self
            .chains
            .chain_ids(account, include_federated_parent)
            .await?;
        let root_first: Vec<AccountId> = closest_first.iter().rev().copied().collect();

        if let Some(binding) = self
            .bindings
            .find_in_account_priority(&root_first, key.id, true)
            .await?
        {
            return Ok(Some(binding));
        }

        self.bindings
            .find_in_account_priority(&closest_first, key.id, false)
            .await
    }

    pub async fn binding_on_in_account(
        &self,
        key: &DeveloperKey,
        account: &Account,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .resolve(key, Some(account))
            .await?
            .is_some_and(|binding| binding.is_on()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BindingState, NewDeveloperKey};
    use crate::services::cache::MemoryCache;
    use crate::services::memory::MemoryStore;
    use crate::services::store::{DeveloperKeyStore, Stores};

    struct World {
        store: Arc<MemoryStore>,
        resolver: BindingResolver,
        root: Account,
        child: Account,
    }

    fn world() -> World {
        let store = Arc::new(MemoryStore::new(Account::new_site_admin(1, 1)));
        let root = Account::new_root(10, "Root", 1);
        let child = Account::new_sub_account(11, "Child", &root);
        store.insert_account(root.clone());
        store.insert_account(child.clone());

        let stores = Stores::from_single(store.clone());
        let cache = Arc::new(DeveloperKeyCache::new(
            Arc::new(MemoryCache::new()),
            stores.clone(),
            1,
            300,
        ));
        let resolver = BindingResolver::new(
            Arc::new(AccountChainResolver::new(stores.accounts.clone())),
            stores.bindings.clone(),
            cache,
        );
        World {
            store,
            resolver,
            root,
            child,
        }
    }

    async fn bind(store: &MemoryStore, key: &DeveloperKey, account_id: AccountId, state: BindingState) {
        store
            .create_binding(DeveloperKeyAccountBinding::new(key.id, account_id).with_state(state))
            .await
            .unwrap();
    }

    async fn account_key(store: &MemoryStore) -> DeveloperKey {
        store
            .insert_key(DeveloperKey::new(
                NewDeveloperKey {
                    account_id: Some(10),
                    ..Default::default()
                },
                1,
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_account_resolves_nothing() {
        let w = world();
        let key = account_key(&w.store).await;
        bind(&w.store, &key, 10, BindingState::On).await;
        assert!(w.resolver.resolve(&key, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_root_binding_beats_child_allow() {
        let w = world();
        let key = account_key(&w.store).await;
        bind(&w.store, &key, 10, BindingState::Off).await;
        bind(&w.store, &key, 11, BindingState::Allow).await;

        let binding = w.resolver.resolve(&key, Some(&w.child)).await.unwrap().unwrap();
        assert_eq!(binding.account_id, 10);
        assert!(binding.is_off());
    }

    #[tokio::test]
    async fn test_closest_allow_wins_without_explicit_binding() {
        let w = world();
        let key = account_key(&w.store).await;
        bind(&w.store, &key, 10, BindingState::Allow).await;
        bind(&w.store, &key, 11, BindingState::Allow).await;

        let binding = w.resolver.resolve(&key, Some(&w.child)).await.unwrap().unwrap();
        assert_eq!(binding.account_id, 11);
    }

    #[tokio::test]
    async fn test_child_explicit_binding_applies_below_root_allow() {
        let w = world();
        let key = account_key(&w.store).await;
        bind(&w.store, &key, 10, BindingState::Allow).await;
        bind(&w.store, &key, 11, BindingState::On).await;

        assert!(w.resolver.binding_on_in_account(&key, &w.child).await.unwrap());
        let at_root = w.resolver.resolve(&key, Some(&w.root)).await.unwrap().unwrap();
        assert!(at_root.is_allow());
    }

    #[tokio::test]
    async fn test_site_admin_binding_short_circuits() {
        let w = world();
        let key = w
            .store
            .insert_key(DeveloperKey::new(NewDeveloperKey::default(), 1))
            .await
            .unwrap();
        bind(&w.store, &key, 1, BindingState::On).await;
        bind(&w.store, &key, 10, BindingState::Off).await;

        let binding = w.resolver.resolve(&key, Some(&w.child)).await.unwrap().unwrap();
        assert_eq!(binding.account_id, 1);
        assert!(binding.is_on());
    }
}
