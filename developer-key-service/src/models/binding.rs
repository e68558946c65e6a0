//! Developer key account binding - per-account authorization of a key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::AccountId;
use super::developer_key::DeveloperKeyId;

/// Binding workflow state.
///
/// `On` and `Off` are explicitly set by an administrator. `Allow` defers the
/// decision to accounts further down the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    On,
    Off,
    Allow,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::On => "on",
            BindingState::Off => "off",
            BindingState::Allow => "allow",
        }
    }

    pub fn is_explicitly_set(&self) -> bool {
        !matches!(self, BindingState::Allow)
    }
}

impl std::str::FromStr for BindingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(BindingState::On),
            "off" => Ok(BindingState::Off),
            "allow" => Ok(BindingState::Allow),
            _ => Err(format!("Invalid binding state: {}", s)),
        }
    }
}

/// State given to bindings created without an explicit choice.
pub const DEFAULT_BINDING_STATE: BindingState = BindingState::Off;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeveloperKeyAccountBinding {
    pub id: i64,
    pub developer_key_id: DeveloperKeyId,
    pub account_id: AccountId,
    pub workflow_state: BindingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeveloperKeyAccountBinding {
    /// Create an unsaved binding in the default state. The store assigns the id.
    pub fn new(developer_key_id: DeveloperKeyId, account_id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            developer_key_id,
            account_id,
            workflow_state: DEFAULT_BINDING_STATE,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_state(mut self, state: BindingState) -> Self {
        self.workflow_state = state;
        self
    }

    pub fn is_on(&self) -> bool {
        self.workflow_state == BindingState::On
    }

    pub fn is_off(&self) -> bool {
        self.workflow_state == BindingState::Off
    }

    pub fn is_allow(&self) -> bool {
        self.workflow_state == BindingState::Allow
    }

    pub fn is_explicitly_set(&self) -> bool {
        self.workflow_state.is_explicitly_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_binding_defaults_to_off() {
        let binding = DeveloperKeyAccountBinding::new(1, 2);
        assert!(binding.is_off());
        assert!(binding.is_explicitly_set());
    }

    #[test]
    fn test_allow_is_not_explicit() {
        let binding = DeveloperKeyAccountBinding::new(1, 2).with_state(BindingState::Allow);
        assert!(binding.is_allow());
        assert!(!binding.is_explicitly_set());
    }

    #[test]
    fn test_parse_binding_state() {
        assert_eq!("ON".parse::<BindingState>(), Ok(BindingState::On));
        assert!("maybe".parse::<BindingState>().is_err());
    }
}
