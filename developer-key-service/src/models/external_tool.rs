//! Context external tool - an installed tool backed by a developer key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::account::{AccountId, ShardId};
use super::developer_key::DeveloperKeyId;
use super::tool_configuration::{PrivacyLevel, ToolConfiguration};

pub type ToolId = i64;

/// Tool workflow state. The privacy levels double as the active states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolWorkflowState {
    Anonymous,
    NameOnly,
    EmailOnly,
    Public,
    Disabled,
    Deleted,
}

impl ToolWorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolWorkflowState::Anonymous => "anonymous",
            ToolWorkflowState::NameOnly => "name_only",
            ToolWorkflowState::EmailOnly => "email_only",
            ToolWorkflowState::Public => "public",
            ToolWorkflowState::Disabled => "disabled",
            ToolWorkflowState::Deleted => "deleted",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, ToolWorkflowState::Disabled | ToolWorkflowState::Deleted)
    }
}

impl From<PrivacyLevel> for ToolWorkflowState {
    fn from(level: PrivacyLevel) -> Self {
        match level {
            PrivacyLevel::Anonymous => ToolWorkflowState::Anonymous,
            PrivacyLevel::NameOnly => ToolWorkflowState::NameOnly,
            PrivacyLevel::EmailOnly => ToolWorkflowState::EmailOnly,
            PrivacyLevel::Public => ToolWorkflowState::Public,
        }
    }
}

/// What a tool is installed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ToolContext {
    Account(AccountId),
    Course(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextExternalTool {
    pub id: ToolId,
    pub shard_id: ShardId,
    pub developer_key_id: DeveloperKeyId,
    pub root_account_id: AccountId,
    pub context: Option<ToolContext>,
    pub name: String,
    pub url: String,
    pub domain: Option<String>,
    pub custom_fields: BTreeMap<String, String>,
    pub settings: serde_json::Value,
    pub workflow_state: ToolWorkflowState,
    pub updated_at: DateTime<Utc>,
}

impl ContextExternalTool {
    /// Install a tool from a key's configuration. The store assigns the id.
    pub fn install(
        shard_id: ShardId,
        developer_key_id: DeveloperKeyId,
        root_account_id: AccountId,
        context: ToolContext,
        config: &ToolConfiguration,
    ) -> Self {
        let mut tool = Self {
            id: 0,
            shard_id,
            developer_key_id,
            root_account_id,
            context: Some(context),
            name: String::new(),
            url: String::new(),
            domain: None,
            custom_fields: BTreeMap::new(),
            settings: serde_json::Value::Null,
            workflow_state: config.privacy_level.into(),
            updated_at: Utc::now(),
        };
        tool.apply_configuration(config);
        tool
    }

    pub fn with_state(mut self, state: ToolWorkflowState) -> Self {
        self.workflow_state = state;
        self
    }

    /// Re-sync the launch settings from `config`. Disabled and deleted tools
    /// keep their state; active tools pick up the configured privacy level.
    pub fn apply_configuration(&mut self, config: &ToolConfiguration) {
        self.name = config.title.clone();
        self.url = config.target_link_uri.clone();
        self.domain = config.domain.clone();
        self.custom_fields = config.custom_fields.clone();
        self.settings = config.settings.clone();
        if self.workflow_state.is_active() {
            self.workflow_state = config.privacy_level.into();
        }
        self.updated_at = Utc::now();
    }
}
