//! Tool configuration attached to LTI developer keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Privacy level a tool is installed with. Enabled tools carry their
/// configuration's privacy level as workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Anonymous,
    NameOnly,
    EmailOnly,
    Public,
}

impl PrivacyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyLevel::Anonymous => "anonymous",
            PrivacyLevel::NameOnly => "name_only",
            PrivacyLevel::EmailOnly => "email_only",
            PrivacyLevel::Public => "public",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfiguration {
    pub title: String,
    pub target_link_uri: String,
    pub domain: Option<String>,
    pub privacy_level: PrivacyLevel,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl ToolConfiguration {
    pub fn new(title: impl Into<String>, target_link_uri: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            target_link_uri: target_link_uri.into(),
            domain: None,
            privacy_level: PrivacyLevel::Anonymous,
            custom_fields: BTreeMap::new(),
            settings: serde_json::Value::Null,
        }
    }

    pub fn with_privacy_level(mut self, privacy_level: PrivacyLevel) -> Self {
        self.privacy_level = privacy_level;
        self
    }
}

/// Where a key's tool configuration comes from. A key holds at most one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "configuration", rename_all = "snake_case")]
pub enum ToolConfigurationSource {
    /// Dynamic registration through the IMS registration flow.
    ImsRegistration(ToolConfiguration),
    /// Legacy manually entered configuration.
    Manual(ToolConfiguration),
}

impl ToolConfigurationSource {
    pub fn configuration(&self) -> &ToolConfiguration {
        match self {
            ToolConfigurationSource::ImsRegistration(config) => config,
            ToolConfigurationSource::Manual(config) => config,
        }
    }

    pub fn is_ims_registration(&self) -> bool {
        matches!(self, ToolConfigurationSource::ImsRegistration(_))
    }
}
