pub mod access_token;
pub mod account;
pub mod binding;
pub mod developer_key;
pub mod external_tool;
pub mod scopes;
pub mod tool_configuration;

pub use access_token::AccessToken;
pub use account::{Account, AccountId, Context, Course, ShardId};
pub use binding::{BindingState, DeveloperKeyAccountBinding, DEFAULT_BINDING_STATE};
pub use developer_key::{
    ClientType, DeveloperKey, DeveloperKeyId, KeyWorkflowState, NewDeveloperKey, RedirectUris,
};
pub use external_tool::{ContextExternalTool, ToolContext, ToolId, ToolWorkflowState};
pub use scopes::ScopeRegistry;
pub use tool_configuration::{PrivacyLevel, ToolConfiguration, ToolConfigurationSource};
