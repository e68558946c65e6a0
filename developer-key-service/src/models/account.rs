//! Account model - node in the account hierarchy.

use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type ShardId = i64;

/// Multiplier used to fold a shard id into a global id.
pub const SHARD_ID_FACTOR: i64 = 10_000_000_000_000;

/// Build the global id of a record from its shard and local id.
pub fn global_id_for(shard_id: ShardId, local_id: i64) -> i64 {
    shard_id * SHARD_ID_FACTOR + local_id
}

/// Account entity.
///
/// Root accounts have no parent. A root account that is not the primary
/// settings authority of a federation defers to its federated parent, whose
/// chain is appended when resolving bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub parent_account_id: Option<AccountId>,
    pub root_account_id: Option<AccountId>,
    pub shard_id: ShardId,
    pub site_admin: bool,
    pub primary_settings_root_account: bool,
    pub federated_parent_account_id: Option<AccountId>,
}

impl Account {
    /// Create a new root account.
    pub fn new_root(id: AccountId, name: impl Into<String>, shard_id: ShardId) -> Self {
        Self {
            id,
            name: name.into(),
            parent_account_id: None,
            root_account_id: None,
            shard_id,
            site_admin: false,
            primary_settings_root_account: true,
            federated_parent_account_id: None,
        }
    }

    /// Create the site admin account.
    pub fn new_site_admin(id: AccountId, shard_id: ShardId) -> Self {
        Self {
            site_admin: true,
            ..Self::new_root(id, "Site Admin", shard_id)
        }
    }

    /// Create a sub-account under `parent`, on the parent's shard.
    pub fn new_sub_account(id: AccountId, name: impl Into<String>, parent: &Account) -> Self {
        Self {
            id,
            name: name.into(),
            parent_account_id: Some(parent.id),
            root_account_id: Some(parent.resolved_root_account_id()),
            shard_id: parent.shard_id,
            site_admin: false,
            primary_settings_root_account: false,
            federated_parent_account_id: None,
        }
    }

    /// Mark this root account as a federation member that defers settings to
    /// `parent_id`.
    pub fn with_federated_parent(mut self, parent_id: AccountId) -> Self {
        self.primary_settings_root_account = false;
        self.federated_parent_account_id = Some(parent_id);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_account_id.is_none()
    }

    pub fn resolved_root_account_id(&self) -> AccountId {
        self.root_account_id.unwrap_or(self.id)
    }

    pub fn global_id(&self) -> i64 {
        global_id_for(self.shard_id, self.id)
    }
}

/// Course entity, as far as key authorization cares about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub name: String,
    pub account: Account,
}

/// Context a developer key is used in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Context {
    Account(Account),
    Course(Course),
}

impl Context {
    /// The account whose bindings govern this context.
    pub fn account(&self) -> &Account {
        match self {
            Context::Account(account) => account,
            Context::Course(course) => &course.account,
        }
    }
}
