//! Propagation of developer key state changes to installed external tools.
//!
//! An action scheduled for a site admin key (or with no affected account) fans
//! out to every shard of every region: one global job enqueues a job per
//! region, each of which enqueues a job per shard. Any other account gets a
//! single job on the shard holding it, limited to its root account.
//!
//! Binding changes on sub-accounts leave tools alone: a sub-account binding
//! can be overridden from above, and tools are scoped by root account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use super::error::ServiceError;
use super::error_reporter::ErrorReporter;
use super::jobs::{EnqueueArgs, Job, JobError, JobQueue, Strand, JOB_ERROR_CATEGORY};
use super::metrics::record_tool_management;
use super::store::{AccountStore, BindingStore, ExternalToolStore, Stores, ToolScope, ToolStateFilter};
use super::topology::TopologyProvider;
use crate::models::account::global_id_for;
use crate::models::{Account, AccountId, BindingState, DeveloperKey, ShardId, ToolWorkflowState};

pub const TOOL_MANAGEMENT_STRAND: &str = "developer_key_tool_management";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolAction {
    Enable,
    Disable,
    Restore,
    Update,
    Destroy,
}

impl ToolAction {
    /// Actions scheduled from an account binding change.
    pub fn follows_binding(&self) -> bool {
        matches!(
            self,
            ToolAction::Enable | ToolAction::Disable | ToolAction::Restore
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolAction::Enable => "enable",
            ToolAction::Disable => "disable",
            ToolAction::Restore => "restore",
            ToolAction::Update => "update",
            ToolAction::Destroy => "destroy",
        }
    }
}

impl fmt::Display for ToolAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ToolManagementConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for ToolManagementConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_attempts: 4,
        }
    }
}

/// Where a `manage` call sent its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolManagementDispatch {
    /// The key has no tool configuration, or a binding action targeted a
    /// sub-account.
    Skipped,
    Global,
    Shard(ShardId),
}

pub struct ToolLifecycleCoordinator {
    accounts: Arc<dyn AccountStore>,
    bindings: Arc<dyn BindingStore>,
    tools: Arc<dyn ExternalToolStore>,
    topology: Arc<dyn TopologyProvider>,
    queue: JobQueue,
    reporter: Arc<dyn ErrorReporter>,
    config: ToolManagementConfig,
}

impl ToolLifecycleCoordinator {
    pub fn new(
        stores: &Stores,
        topology: Arc<dyn TopologyProvider>,
        queue: JobQueue,
        reporter: Arc<dyn ErrorReporter>,
        config: ToolManagementConfig,
    ) -> Self {
        Self {
            accounts: stores.accounts.clone(),
            bindings: stores.bindings.clone(),
            tools: stores.tools.clone(),
            topology,
            queue,
            reporter,
            config,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Lane shared by every tool management job of the key's owner.
    pub fn enqueue_args(&self, key: &DeveloperKey) -> EnqueueArgs {
        let owner = key
            .account_id
            .map(|account_id| global_id_for(key.shard_id, account_id).to_string())
            .unwrap_or_else(|| "site_admin".to_string());
        EnqueueArgs {
            strand: Strand::new(TOOL_MANAGEMENT_STRAND, owner),
            max_attempts: self.config.max_attempts,
        }
    }

    /// Schedule `action` for the key's tools. Returns without scheduling
    /// anything when the key has no tool configuration.
    pub fn manage(
        self: &Arc<Self>,
        key: &DeveloperKey,
        action: ToolAction,
        affected_account: Option<&Account>,
    ) -> ToolManagementDispatch {
        if key.tool_configuration().is_none() {
            tracing::debug!(
                developer_key_id = key.global_id(),
                action = %action,
                "Developer key has no tool configuration, skipping tool management"
            );
            return ToolManagementDispatch::Skipped;
        }

        if action.follows_binding()
            && affected_account.is_some_and(|account| !account.site_admin && !account.is_root())
        {
            tracing::debug!(
                developer_key_id = key.global_id(),
                action = %action,
                account_id = ?affected_account.map(|account| account.id),
                "Sub-account binding change, skipping tool management"
            );
            return ToolManagementDispatch::Skipped;
        }

        let args = self.enqueue_args(key);
        let account = affected_account.filter(|account| !account.site_admin);
        let (stage, dispatch) = match account {
            None => (Stage::AllRegions, ToolManagementDispatch::Global),
            Some(account) => {
                let shard_id = self.topology.shard_for_account(account);
                (Stage::Shard(shard_id), ToolManagementDispatch::Shard(shard_id))
            }
        };

        tracing::info!(
            developer_key_id = key.global_id(),
            action = %action,
            account_id = ?affected_account.map(|account| account.id),
            strand = %args.strand,
            dispatch = ?dispatch,
            "Scheduling tool management"
        );

        self.queue.enqueue(
            ToolManagementJob {
                coordinator: self.clone(),
                key: key.clone(),
                action,
                account: affected_account.cloned(),
                started_at: Utc::now(),
                args: args.clone(),
                stage,
            },
            args,
        );
        dispatch
    }

    /// Run `action` on one shard, recording metrics and reporting failures.
    pub async fn manage_on_shard(
        &self,
        key: &DeveloperKey,
        action: ToolAction,
        account: Option<&Account>,
        shard_id: ShardId,
        started_at: DateTime<Utc>,
    ) -> Result<usize, ServiceError> {
        let result = self.run_action(key, action, account, shard_id).await;
        let latency_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        match &result {
            Ok(changed) => {
                record_tool_management(action.as_str(), latency_ms, false);
                tracing::info!(
                    developer_key_id = key.global_id(),
                    action = %action,
                    shard_id,
                    changed,
                    latency_ms,
                    "Managed external tools on shard"
                );
            }
            Err(e) => {
                record_tool_management(action.as_str(), latency_ms, true);
                tracing::error!(
                    developer_key_id = key.global_id(),
                    action = %action,
                    shard_id,
                    error = %e,
                    "Failed to manage external tools on shard"
                );
                self.reporter.capture_exception(
                    JOB_ERROR_CATEGORY,
                    &anyhow::anyhow!(
                        "{} external tools of developer key {} on shard {}: {}",
                        action,
                        key.global_id(),
                        shard_id,
                        e
                    ),
                );
            }
        }

        result
    }

    async fn run_action(
        &self,
        key: &DeveloperKey,
        action: ToolAction,
        account: Option<&Account>,
        shard_id: ShardId,
    ) -> Result<usize, ServiceError> {
        let root_account_id = root_account_scope(account);
        match action {
            ToolAction::Destroy => {
                self.transition(
                    key,
                    shard_id,
                    root_account_id,
                    ToolStateFilter::NotDeleted,
                    ToolWorkflowState::Deleted,
                )
                .await
            }
            ToolAction::Enable => self.enable(key, shard_id, root_account_id).await,
            ToolAction::Disable => self.disable(key, shard_id, root_account_id).await,
            ToolAction::Restore => self.restore(key, shard_id).await,
            ToolAction::Update => self.update(key, shard_id, root_account_id).await,
        }
    }

    async fn enable(
        &self,
        key: &DeveloperKey,
        shard_id: ShardId,
        root_account_id: Option<AccountId>,
    ) -> Result<usize, ServiceError> {
        let Some(config) = key.tool_configuration() else {
            return Ok(0);
        };
        self.transition(
            key,
            shard_id,
            root_account_id,
            ToolStateFilter::Disabled,
            config.privacy_level.into(),
        )
        .await
    }

    async fn disable(
        &self,
        key: &DeveloperKey,
        shard_id: ShardId,
        root_account_id: Option<AccountId>,
    ) -> Result<usize, ServiceError> {
        if key.tool_configuration().is_none() {
            return Ok(0);
        }
        self.transition(
            key,
            shard_id,
            root_account_id,
            ToolStateFilter::Active,
            ToolWorkflowState::Disabled,
        )
        .await
    }

    /// Re-apply each root account's binding to its tools. Stops at the first
    /// root account without a binding.
    async fn restore(&self, key: &DeveloperKey, shard_id: ShardId) -> Result<usize, ServiceError> {
        if key.tool_configuration().is_none() {
            return Ok(0);
        }

        let mut changed = 0;
        for root_account in self.accounts.root_accounts_on_shard(shard_id).await? {
            if root_account.site_admin {
                continue;
            }

            let Some(binding) = self.bindings.find_binding(key.id, root_account.id).await? else {
                tracing::warn!(
                    developer_key_id = key.global_id(),
                    account_id = root_account.id,
                    shard_id,
                    "Root account has no binding, abandoning restore"
                );
                return Ok(changed);
            };

            changed += match binding.workflow_state {
                BindingState::On => self.enable(key, shard_id, Some(root_account.id)).await?,
                BindingState::Off => self.disable(key, shard_id, Some(root_account.id)).await?,
                BindingState::Allow => 0,
            };
        }
        Ok(changed)
    }

    async fn update(
        &self,
        key: &DeveloperKey,
        shard_id: ShardId,
        root_account_id: Option<AccountId>,
    ) -> Result<usize, ServiceError> {
        let Some(config) = key.tool_configuration() else {
            return Ok(0);
        };

        let scope = ToolScope {
            developer_key_id: key.id,
            root_account_id,
            filter: ToolStateFilter::NotDeleted,
        };
        let ids = self.tools.tool_ids_in_scope(shard_id, &scope).await?;

        let mut updated = 0;
        for batch in ids.chunks(self.config.batch_size.max(1)) {
            for mut tool in self.tools.find_tools(batch).await? {
                if tool.context.is_none() {
                    tracing::debug!(tool_id = tool.id, "Skipping external tool without a context");
                    continue;
                }
                tool.apply_configuration(config);
                self.tools.save_tool(&tool).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn transition(
        &self,
        key: &DeveloperKey,
        shard_id: ShardId,
        root_account_id: Option<AccountId>,
        filter: ToolStateFilter,
        state: ToolWorkflowState,
    ) -> Result<usize, ServiceError> {
        let scope = ToolScope {
            developer_key_id: key.id,
            root_account_id,
            filter,
        };
        let ids = self.tools.tool_ids_in_scope(shard_id, &scope).await?;

        let mut changed = 0;
        for batch in ids.chunks(self.config.batch_size.max(1)) {
            changed += self.tools.set_tool_workflow_state(batch, state).await?;
        }
        Ok(changed)
    }
}

/// Tools of site admin (or unspecified) accounts are not limited by root
/// account.
fn root_account_scope(account: Option<&Account>) -> Option<AccountId> {
    account
        .filter(|account| !account.site_admin)
        .map(Account::resolved_root_account_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    AllRegions,
    Region(String),
    Shard(ShardId),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stage::AllRegions => write!(f, "all_regions"),
            Stage::Region(region) => write!(f, "region:{}", region),
            Stage::Shard(shard_id) => write!(f, "shard:{}", shard_id),
        }
    }
}

struct ToolManagementJob {
    coordinator: Arc<ToolLifecycleCoordinator>,
    key: DeveloperKey,
    action: ToolAction,
    account: Option<Account>,
    started_at: DateTime<Utc>,
    args: EnqueueArgs,
    stage: Stage,
}

impl ToolManagementJob {
    fn at(&self, stage: Stage) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            key: self.key.clone(),
            action: self.action,
            account: self.account.clone(),
            started_at: self.started_at,
            args: self.args.clone(),
            stage,
        }
    }
}

#[async_trait]
impl Job for ToolManagementJob {
    fn name(&self) -> String {
        format!(
            "DeveloperKey#{}.manage_external_tools[{}@{}]",
            self.key.global_id(),
            self.action,
            self.stage
        )
    }

    async fn perform(&self, queue: &JobQueue) -> Result<(), JobError> {
        let topology = &self.coordinator.topology;
        match &self.stage {
            Stage::AllRegions => {
                let regions = topology
                    .list_regions()
                    .await
                    .map_err(|e| JobError::Retriable(e.into()))?;
                for region in regions {
                    queue.enqueue(self.at(Stage::Region(region)), self.args.clone());
                }
                Ok(())
            }
            Stage::Region(region) => {
                let shards = topology
                    .list_shards(region)
                    .await
                    .map_err(|e| JobError::Retriable(e.into()))?;
                for shard_id in shards {
                    queue.enqueue(self.at(Stage::Shard(shard_id)), self.args.clone());
                }
                Ok(())
            }
            Stage::Shard(shard_id) => self
                .coordinator
                .manage_on_shard(
                    &self.key,
                    self.action,
                    self.account.as_ref(),
                    *shard_id,
                    self.started_at,
                )
                .await
                .map(|_| ())
                .map_err(|e| {
                    if e.is_retryable() {
                        JobError::Retriable(e.into())
                    } else {
                        JobError::Fatal(e.into())
                    }
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewDeveloperKey, ToolConfiguration, ToolConfigurationSource};
    use crate::services::error_reporter::MockErrorReporter;
    use crate::services::jobs::JobQueueConfig;
    use crate::services::memory::MemoryStore;
    use crate::services::topology::StaticTopology;

    fn coordinator() -> Arc<ToolLifecycleCoordinator> {
        let store = Arc::new(MemoryStore::new(Account::new_site_admin(1, 1)));
        let reporter = Arc::new(MockErrorReporter::new());
        Arc::new(ToolLifecycleCoordinator::new(
            &Stores::from_single(store),
            Arc::new(StaticTopology::single(1)),
            JobQueue::new(reporter.clone(), JobQueueConfig::no_backoff()),
            reporter,
            ToolManagementConfig::default(),
        ))
    }

    fn lti_key(account_id: Option<AccountId>) -> DeveloperKey {
        let mut key = DeveloperKey::new(
            NewDeveloperKey {
                account_id,
                tool_configuration: Some(ToolConfigurationSource::Manual(ToolConfiguration::new(
                    "Tool",
                    "https://tool.example.com/launch",
                ))),
                ..Default::default()
            },
            3,
        );
        key.id = 8;
        key
    }

    #[test]
    fn test_strand_uses_owner_global_id() {
        let coordinator = coordinator();
        let args = coordinator.enqueue_args(&lti_key(Some(42)));
        assert_eq!(args.strand.purpose, TOOL_MANAGEMENT_STRAND);
        assert_eq!(args.strand.key, "30000000000042");
        assert_eq!(args.max_attempts, 4);

        let site_admin_args = coordinator.enqueue_args(&lti_key(None));
        assert_eq!(site_admin_args.strand.key, "site_admin");
    }

    #[tokio::test]
    async fn test_key_without_tool_configuration_is_skipped() {
        let coordinator = coordinator();
        let mut key = lti_key(None);
        key.tool_configuration = None;

        let dispatch = coordinator.manage(&key, ToolAction::Disable, None);
        assert_eq!(dispatch, ToolManagementDispatch::Skipped);
        assert_eq!(coordinator.queue().stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_binding_actions_skip_sub_accounts() {
        let coordinator = coordinator();
        let root = Account::new_root(10, "Root", 1);
        let child = Account::new_sub_account(11, "Child", &root);
        let key = lti_key(Some(root.id));

        for action in [ToolAction::Enable, ToolAction::Disable, ToolAction::Restore] {
            assert_eq!(
                coordinator.manage(&key, action, Some(&child)),
                ToolManagementDispatch::Skipped
            );
        }
        assert_eq!(coordinator.queue().stats().enqueued, 0);

        assert_eq!(
            coordinator.manage(&key, ToolAction::Update, Some(&child)),
            ToolManagementDispatch::Shard(1)
        );
        coordinator.queue().drain().await;
        assert_eq!(coordinator.queue().stats().completed, 1);
    }

    #[test]
    fn test_root_account_scope() {
        let site_admin = Account::new_site_admin(1, 1);
        let root = Account::new_root(10, "Root", 1);
        let child = Account::new_sub_account(11, "Child", &root);
        assert_eq!(root_account_scope(None), None);
        assert_eq!(root_account_scope(Some(&site_admin)), None);
        assert_eq!(root_account_scope(Some(&child)), Some(10));
    }
}
