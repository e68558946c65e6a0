//! Developer key model - OAuth client and LTI registration credentials.

use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use url::Url;
use validator::ValidationErrors;

use super::account::{global_id_for, AccountId, ShardId};
use super::scopes::ScopeRegistry;
use super::tool_configuration::{ToolConfiguration, ToolConfigurationSource};
use crate::utils::validation::{
    field_error, normalized_site, public_jwk_errors, validate_url, MAX_REDIRECT_URI_LENGTH,
};

pub type DeveloperKeyId = i64;

/// Flow letting a key mint tokens for a pre-determined service user.
pub const SERVICE_USER_CLIENT_CREDENTIALS: &str = "service_user_client_credentials";

/// Flows a key may list in `authorized_flows`.
pub const ALLOWED_AUTHORIZED_FLOWS: &[&str] = &[SERVICE_USER_CLIENT_CREDENTIALS];

/// Client credentials audience for tokens verified by third parties.
pub const EXTERNAL_AUDIENCE: &str = "external";

/// Name of the key backing user-generated access tokens.
pub const DEFAULT_KEY_NAME: &str = "User-Generated";

const API_KEY_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyWorkflowState {
    Active,
    Inactive,
    Deleted,
}

impl KeyWorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyWorkflowState::Active => "active",
            KeyWorkflowState::Inactive => "inactive",
            KeyWorkflowState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for KeyWorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Public,
    #[default]
    Confidential,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientType::Public => write!(f, "public"),
            ClientType::Confidential => write!(f, "confidential"),
        }
    }
}

/// Workflow event that is not allowed from the key's current state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {event} a developer key in state {from}")]
pub struct WorkflowTransitionError {
    pub from: KeyWorkflowState,
    pub event: &'static str,
}

/// Redirect URI input: either a list or a whitespace separated string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RedirectUris {
    Joined(String),
    List(Vec<String>),
}

impl RedirectUris {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            RedirectUris::Joined(value) => value.split_whitespace().map(String::from).collect(),
            RedirectUris::List(values) => values,
        }
    }
}

impl From<&str> for RedirectUris {
    fn from(value: &str) -> Self {
        RedirectUris::Joined(value.to_string())
    }
}

impl From<String> for RedirectUris {
    fn from(value: String) -> Self {
        RedirectUris::Joined(value)
    }
}

impl From<Vec<String>> for RedirectUris {
    fn from(values: Vec<String>) -> Self {
        RedirectUris::List(values)
    }
}

impl From<Vec<&str>> for RedirectUris {
    fn from(values: Vec<&str>) -> Self {
        RedirectUris::List(values.into_iter().map(String::from).collect())
    }
}

/// Attributes accepted when creating a key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDeveloperKey {
    pub name: Option<String>,
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub client_type: ClientType,
    pub api_key: Option<String>,
    pub vendor_code: Option<String>,
    pub redirect_uri: Option<String>,
    pub redirect_uris: Option<RedirectUris>,
    pub oidc_initiation_url: Option<String>,
    pub public_jwk: Option<serde_json::Value>,
    pub public_jwk_url: Option<String>,
    pub icon_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub require_scopes: bool,
    #[serde(default)]
    pub authorized_flows: Vec<String>,
    #[serde(default)]
    pub force_token_reuse: bool,
    #[serde(default)]
    pub internal_service: bool,
    #[serde(default)]
    pub test_cluster_only: bool,
    pub client_credentials_audience: Option<String>,
    pub service_user_id: Option<i64>,
    pub tool_configuration: Option<ToolConfigurationSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeveloperKey {
    pub id: DeveloperKeyId,
    pub shard_id: ShardId,
    pub name: Option<String>,
    pub workflow_state: KeyWorkflowState,
    pub client_type: ClientType,
    pub account_id: Option<AccountId>,
    pub root_account_id: Option<AccountId>,
    pub api_key: Option<String>,
    pub vendor_code: Option<String>,
    pub redirect_uri: Option<String>,
    pub redirect_uris: Vec<String>,
    pub oidc_initiation_url: Option<String>,
    pub public_jwk: Option<serde_json::Value>,
    pub public_jwk_url: Option<String>,
    pub icon_url: Option<String>,
    pub scopes: Vec<String>,
    pub require_scopes: bool,
    pub authorized_flows: Vec<String>,
    pub visible: bool,
    pub auto_expire_tokens: bool,
    pub force_token_reuse: bool,
    pub internal_service: bool,
    pub test_cluster_only: bool,
    pub client_credentials_audience: Option<String>,
    pub service_user_id: Option<i64>,
    pub tool_configuration: Option<ToolConfigurationSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeveloperKey {
    /// Build an unsaved key on `shard_id`. The store assigns the id.
    pub fn new(params: NewDeveloperKey, shard_id: ShardId) -> Self {
        let now = Utc::now();
        let mut key = Self {
            id: 0,
            shard_id,
            name: params.name,
            workflow_state: KeyWorkflowState::Active,
            client_type: params.client_type,
            account_id: params.account_id,
            root_account_id: None,
            api_key: params.api_key,
            vendor_code: params.vendor_code,
            redirect_uri: None,
            redirect_uris: Vec::new(),
            oidc_initiation_url: params.oidc_initiation_url,
            public_jwk: params.public_jwk,
            public_jwk_url: params.public_jwk_url,
            icon_url: params.icon_url,
            scopes: params.scopes,
            require_scopes: params.require_scopes,
            authorized_flows: params.authorized_flows,
            visible: false,
            auto_expire_tokens: false,
            force_token_reuse: params.force_token_reuse,
            internal_service: params.internal_service,
            test_cluster_only: params.test_cluster_only,
            client_credentials_audience: params.client_credentials_audience,
            service_user_id: params.service_user_id,
            tool_configuration: params.tool_configuration,
            created_at: now,
            updated_at: now,
        };
        key.set_redirect_uri(params.redirect_uri);
        if let Some(uris) = params.redirect_uris {
            key.set_redirect_uris(uris);
        }
        key
    }

    pub fn global_id(&self) -> i64 {
        global_id_for(self.shard_id, self.id)
    }

    pub fn is_active(&self) -> bool {
        self.workflow_state == KeyWorkflowState::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.workflow_state == KeyWorkflowState::Deleted
    }

    /// Keys without an owning account belong to site admin.
    pub fn is_site_admin_owned(&self) -> bool {
        self.account_id.is_none()
    }

    pub fn is_public_client(&self) -> bool {
        self.client_type == ClientType::Public
    }

    pub fn activate(&mut self) -> Result<(), WorkflowTransitionError> {
        match self.workflow_state {
            KeyWorkflowState::Inactive => {
                self.workflow_state = KeyWorkflowState::Active;
                Ok(())
            }
            from => Err(WorkflowTransitionError {
                from,
                event: "activate",
            }),
        }
    }

    pub fn deactivate(&mut self) -> Result<(), WorkflowTransitionError> {
        match self.workflow_state {
            KeyWorkflowState::Active => {
                self.workflow_state = KeyWorkflowState::Inactive;
                Ok(())
            }
            from => Err(WorkflowTransitionError {
                from,
                event: "deactivate",
            }),
        }
    }

    /// Blank values clear the legacy redirect URI.
    pub fn set_redirect_uri(&mut self, value: Option<String>) {
        self.redirect_uri = value.filter(|v| !v.trim().is_empty());
    }

    pub fn set_redirect_uris(&mut self, value: impl Into<RedirectUris>) {
        self.redirect_uris = value.into().into_vec();
    }

    /// IMS registration takes precedence over a manual configuration.
    pub fn tool_configuration(&self) -> Option<&ToolConfiguration> {
        self.tool_configuration
            .as_ref()
            .map(ToolConfigurationSource::configuration)
    }

    pub fn has_ims_registration(&self) -> bool {
        self.tool_configuration
            .as_ref()
            .is_some_and(ToolConfigurationSource::is_ims_registration)
    }

    pub fn is_lti_key(&self) -> bool {
        self.tool_configuration.is_some()
    }

    pub fn uses_external_audience(&self) -> bool {
        self.client_credentials_audience.as_deref() == Some(EXTERNAL_AUDIENCE)
    }

    /// Whether the key may run a client credentials grant as its service user.
    pub fn site_admin_service_auth(&self) -> bool {
        self.authorized_flows
            .iter()
            .any(|flow| flow == SERVICE_USER_CLIENT_CREDENTIALS)
            && self.service_user_id.is_some()
    }

    /// Token lifetime for this key. Confidential clients get non-expiring
    /// tokens; public clients get a rolling window.
    pub fn tokens_expire_in(&self, public_client_ttl_minutes: f64) -> Option<Duration> {
        if !self.is_public_client() {
            return None;
        }
        Some(Duration::milliseconds(
            (public_client_ttl_minutes * 60_000.0) as i64,
        ))
    }

    pub fn generate_api_key(&mut self, overwrite: bool) {
        if overwrite || self.api_key.is_none() {
            let api_key: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(API_KEY_LENGTH)
                .map(char::from)
                .collect();
            self.api_key = Some(api_key);
        }
    }

    /// Normalize the attributes validation looks at.
    pub fn normalize(&mut self) {
        if self
            .public_jwk_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            self.public_jwk_url = None;
        }

        let mut seen = HashSet::new();
        self.scopes.retain(|scope| seen.insert(scope.clone()));
    }

    /// Normalize then validate, collecting every field error. The normalized
    /// attributes are only written back when validation passes.
    pub fn validate(&mut self, registry: &ScopeRegistry) -> Result<(), ValidationErrors> {
        let mut candidate = self.clone();
        candidate.normalize();

        let mut errors = ValidationErrors::new();
        candidate.validate_scopes(registry, &mut errors);
        candidate.validate_redirect_uris(&mut errors);
        candidate.validate_urls(&mut errors);
        candidate.validate_public_jwk(&mut errors);
        candidate.validate_lti_fields(&mut errors);
        candidate.validate_flag_combinations(&mut errors);
        candidate.validate_authorized_flows(&mut errors);

        if errors.is_empty() {
            *self = candidate;
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Attribute fixups applied on every save.
    pub fn prepare_for_save(&mut self) {
        if self
            .icon_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            self.icon_url = None;
        }

        // RSA keys never get unscoped API access.
        if self.public_jwk.is_some() || self.public_jwk_url.is_some() {
            self.require_scopes = true;
        }

        self.updated_at = Utc::now();
    }

    /// Whether any scope present in `previous` is gone from this version.
    pub fn scopes_removed_since(&self, previous: &DeveloperKey) -> bool {
        previous
            .scopes
            .iter()
            .any(|scope| !self.scopes.contains(scope))
    }

    /// Exact match, or same scheme, host and port as one of the redirect URIs.
    pub fn redirect_uri_matches(&self, redirect_uri: &str) -> bool {
        if redirect_uri.trim().is_empty() {
            return false;
        }

        let Some(normalized) = normalized_site(redirect_uri) else {
            return false;
        };

        if self.redirect_uris.iter().any(|uri| uri == redirect_uri) {
            return true;
        }

        self.redirect_uris
            .iter()
            .filter_map(|uri| normalized_site(uri))
            .any(|site| site == normalized)
    }

    /// Lenient legacy check: exact match against the redirect URIs, or the
    /// same scheme and a host equal to, or a subdomain of, the legacy
    /// `redirect_uri` host.
    pub fn redirect_domain_matches(&self, redirect_uri: &str) -> bool {
        if redirect_uri.trim().is_empty() {
            return false;
        }
        if self.redirect_uris.iter().any(|uri| uri == redirect_uri) {
            return true;
        }

        let Some(own_uri) = self.redirect_uri.as_deref() else {
            return false;
        };
        let (Ok(own), Ok(other)) = (Url::parse(own_uri), Url::parse(redirect_uri)) else {
            return false;
        };
        let (Some(own_domain), Some(other_domain)) = (own.host_str(), other.host_str()) else {
            return false;
        };

        let matches = !own_domain.is_empty()
            && !other_domain.is_empty()
            && own.scheme() == other.scheme()
            && (own_domain == other_domain
                || other_domain.ends_with(&format!(".{}", own_domain)));

        if matches && redirect_uri != own_uri {
            tracing::info!(
                redirect_uri = %redirect_uri,
                developer_key_id = self.global_id(),
                "Allowed lenient OAuth redirect uri"
            );
        }

        matches
    }

    fn validate_scopes(&self, registry: &ScopeRegistry, errors: &mut ValidationErrors) {
        let unknown = registry.unknown(&self.scopes);
        if !unknown.is_empty() {
            errors.add(
                "scopes",
                field_error("invalid_scope", format!("cannot contain {}", unknown.join(", "))),
            );
        }
    }

    fn validate_redirect_uris(&mut self, errors: &mut ValidationErrors) {
        let validated: Result<Vec<String>, _> = self
            .redirect_uris
            .iter()
            .map(|uri| validate_url(uri))
            .collect();

        match validated {
            Ok(uris) => {
                if uris.iter().any(|uri| uri.len() > MAX_REDIRECT_URI_LENGTH) {
                    errors.add(
                        "redirect_uris",
                        field_error("too_long", "a redirect_uri is too long"),
                    );
                }
                self.redirect_uris = uris;
            }
            Err(_) => errors.add(
                "redirect_uris",
                field_error("invalid_uri", "is not a valid URI"),
            ),
        }
    }

    fn validate_urls(&self, errors: &mut ValidationErrors) {
        let fields: [(&'static str, &Option<String>); 3] = [
            ("redirect_uri", &self.redirect_uri),
            ("oidc_initiation_url", &self.oidc_initiation_url),
            ("public_jwk_url", &self.public_jwk_url),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                if validate_url(value).is_err() {
                    errors.add(field, field_error("invalid_url", "is not a valid URL"));
                }
            }
        }
    }

    fn validate_public_jwk(&self, errors: &mut ValidationErrors) {
        let Some(jwk) = &self.public_jwk else {
            return;
        };
        for message in public_jwk_errors(jwk) {
            errors.add("public_jwk", field_error("invalid_jwk", message));
        }
    }

    fn validate_lti_fields(&self, errors: &mut ValidationErrors) {
        if !self.is_lti_key() || self.public_jwk.is_some() || self.public_jwk_url.is_some() {
            return;
        }
        errors.add(
            "lti_key",
            field_error(
                "missing_public_jwk",
                "developer key must have public jwk or public jwk url",
            ),
        );
    }

    fn validate_flag_combinations(&self, errors: &mut ValidationErrors) {
        if self.auto_expire_tokens && self.force_token_reuse {
            errors.add(
                "auto_expire_tokens",
                field_error(
                    "conflicting_flags",
                    "auto_expire_tokens cannot be set if force_token_reuse is set",
                ),
            );
        }
    }

    fn validate_authorized_flows(&self, errors: &mut ValidationErrors) {
        if self.authorized_flows.is_empty() {
            return;
        }

        let invalid: Vec<&str> = self
            .authorized_flows
            .iter()
            .map(String::as_str)
            .filter(|flow| !ALLOWED_AUTHORIZED_FLOWS.contains(flow))
            .collect();
        if !invalid.is_empty() {
            errors.add(
                "authorized_flows",
                field_error(
                    "invalid_flow",
                    format!("contains invalid values: {}", invalid.join(", ")),
                ),
            );
        }

        let unique: HashSet<&String> = self.authorized_flows.iter().collect();
        if unique.len() != self.authorized_flows.len() {
            errors.add(
                "authorized_flows",
                field_error("duplicate_flow", "contains duplicate values"),
            );
        }
    }
}
