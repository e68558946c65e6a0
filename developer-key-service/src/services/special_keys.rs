//! Registry of named special developer keys.
//!
//! A special key is found through the `{name}_developer_key_id` setting and
//! remembered for the life of the process once loaded.

use dashmap::DashMap;
use std::sync::Arc;

use super::error::ServiceError;
use super::store::SettingsStore;
use crate::models::DeveloperKeyId;

pub fn special_key_setting(name: &str) -> String {
    format!("{}_developer_key_id", name)
}

pub struct SpecialKeyRegistry {
    settings: Arc<dyn SettingsStore>,
    keys: DashMap<String, DeveloperKeyId>,
}

impl SpecialKeyRegistry {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            keys: DashMap::new(),
        }
    }

    /// Id of the named key, from memory or the settings store.
    pub async fn lookup(&self, name: &str) -> Result<Option<DeveloperKeyId>, ServiceError> {
        if let Some(id) = self.remembered(name) {
            return Ok(Some(id));
        }

        let stored = self.settings.get_setting(&special_key_setting(name)).await?;
        match stored.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => match value.parse::<DeveloperKeyId>() {
                Ok(id) => Ok(Some(id)),
                Err(e) => {
                    tracing::warn!(name = %name, value = %value, error = %e, "Ignoring malformed special key setting");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn remembered(&self, name: &str) -> Option<DeveloperKeyId> {
        self.keys.get(name).map(|entry| *entry.value())
    }

    pub fn remember(&self, name: &str, id: DeveloperKeyId) {
        self.keys.insert(name.to_string(), id);
    }

    /// Record a newly created special key in settings and memory.
    pub async fn register(&self, name: &str, id: DeveloperKeyId) -> Result<(), ServiceError> {
        self.settings
            .set_setting(&special_key_setting(name), &id.to_string())
            .await?;
        self.remember(name, id);
        tracing::info!(name = %name, developer_key_id = id, "Registered special developer key");
        Ok(())
    }

    pub fn forget(&self, name: &str) {
        self.keys.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Account;
    use crate::services::memory::MemoryStore;

    fn registry() -> (Arc<MemoryStore>, SpecialKeyRegistry) {
        let store = Arc::new(MemoryStore::new(Account::new_site_admin(1, 1)));
        let registry = SpecialKeyRegistry::new(store.clone());
        (store, registry)
    }

    #[tokio::test]
    async fn test_lookup_reads_setting_and_register_remembers() {
        let (store, registry) = registry();
        assert_eq!(registry.lookup("User-Generated").await.unwrap(), None);

        registry.register("User-Generated", 7).await.unwrap();
        assert_eq!(registry.remembered("User-Generated"), Some(7));
        assert_eq!(
            store
                .get_setting("User-Generated_developer_key_id")
                .await
                .unwrap()
                .as_deref(),
            Some("7")
        );

        registry.forget("User-Generated");
        assert_eq!(registry.lookup("User-Generated").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_blank_or_malformed_setting_is_absent() {
        let (store, registry) = registry();
        store.set_setting("mobile_developer_key_id", " ").await.unwrap();
        assert_eq!(registry.lookup("mobile").await.unwrap(), None);

        store.set_setting("mobile_developer_key_id", "abc").await.unwrap();
        assert_eq!(registry.lookup("mobile").await.unwrap(), None);
    }
}
