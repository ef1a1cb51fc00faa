//! Session - セッション単位のワイヤリングとライフサイクル
//!
//! # 学習ポイント
//! - Builder パターン（必須の port が欠けていれば build() で失敗する）
//! - login で永続化されたキューを復元して配送を再開、logout で未送信を cancel
//! - Session が QueueManager を所有し、他は共有参照だけを持つ（逆参照なし）

use std::sync::Arc;

use crate::domain::{OwnerId, QueueError, TaskId};
use crate::impls::InMemoryQueueStore;
use crate::ports::{Clock, EventStream, LocalStore, QueueStore, RemoteExecutor, SystemClock, UlidGenerator};
use crate::queue::{DEFAULT_HISTORY_LIMIT, RetryPolicy, TaskQueue};

use super::config::FerryConfig;
use super::facade::MutationFacade;
use super::gate::WriteGate;
use super::manager::QueueManager;
use super::reconciler::Reconciler;
use super::status::SessionStatus;

/// SessionBuilder はセッションを構築
///
/// # 使用例
/// ```ignore
/// let session = SessionBuilder::new()
///     .remote(server.clone())
///     .event_stream(server)
///     .local_store(local)
///     .with_config(&config)
///     .build()?;
/// ```
pub struct SessionBuilder {
    remote: Option<Arc<dyn RemoteExecutor>>,
    local: Option<Arc<dyn LocalStore>>,
    events: Option<Arc<dyn EventStream>>,
    queue_store: Option<Arc<dyn QueueStore>>,
    clock: Option<Arc<dyn Clock>>,
    policy: RetryPolicy,
    history_limit: usize,
    online: bool,
}

/// BuildError はセッション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no RemoteExecutor was configured")]
    MissingRemote,

    #[error("no LocalStore was configured")]
    MissingLocalStore,

    #[error("no EventStream was configured")]
    MissingEventStream,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            remote: None,
            local: None,
            events: None,
            queue_store: None,
            clock: None,
            policy: RetryPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            online: true,
        }
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn event_stream(mut self, events: Arc<dyn EventStream>) -> Self {
        self.events = Some(events);
        self
    }

    /// Defaults to an in-memory store (nothing survives the process).
    pub fn queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Retry policy and history limit from the config file. The queue store is
    /// opened separately because that is async.
    pub fn with_config(self, config: &FerryConfig) -> Self {
        self.retry_policy(config.retry_policy())
            .history_limit(config.queue.history_limit)
    }

    /// Start offline: tasks accumulate until `set_online(true)`.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Fails fast if a required port is missing.
    pub fn build(self) -> Result<Session, BuildError> {
        let remote = self.remote.ok_or(BuildError::MissingRemote)?;
        let local = self.local.ok_or(BuildError::MissingLocalStore)?;
        let events = self.events.ok_or(BuildError::MissingEventStream)?;
        let store = self
            .queue_store
            .unwrap_or_else(|| Arc::new(InMemoryQueueStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let queue = Arc::new(
            TaskQueue::new(store, Arc::new(UlidGenerator::new(clock.clone())), clock)
                .with_history_limit(self.history_limit),
        );
        let gate = Arc::new(WriteGate::new());
        let reconciler = Arc::new(Reconciler::new(events, local.clone(), gate.clone()));
        let manager = QueueManager::new(queue, remote, reconciler.clone(), self.policy);
        manager.set_online(self.online);
        let facade = MutationFacade::new(manager.clone(), local, reconciler.clone(), gate);

        Ok(Session {
            manager,
            reconciler,
            facade,
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Session {
    manager: QueueManager,
    reconciler: Arc<Reconciler>,
    facade: MutationFacade,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Restores the owner's persisted queue and starts draining it.
    pub async fn login(&self, owner: &OwnerId) -> Result<SessionStatus, QueueError> {
        let counts = self.manager.resume(owner).await?;
        tracing::info!(%owner, pending = counts.pending, failed = counts.failed, "login");
        Ok(SessionStatus {
            owner: owner.clone(),
            online: self.manager.is_online(),
            counts,
        })
    }

    /// Cancels what has not been dispatched and stops accepting tasks for the owner.
    /// A task already in flight still completes.
    pub async fn logout(&self, owner: &OwnerId) -> Result<Vec<TaskId>, QueueError> {
        let cancelled = self.manager.close(owner).await?;
        self.reconciler.forget(owner);
        tracing::info!(%owner, cancelled = cancelled.len(), "logout");
        Ok(cancelled)
    }

    pub async fn status(&self, owner: &OwnerId) -> Result<SessionStatus, QueueError> {
        Ok(SessionStatus {
            owner: owner.clone(),
            online: self.manager.is_online(),
            counts: self.manager.queue().counts(owner).await?,
        })
    }

    /// Owners with a persisted queue, for resuming after a restart.
    pub async fn persisted_owners(&self) -> Result<Vec<OwnerId>, QueueError> {
        self.manager.queue().persisted_owners().await
    }

    pub fn set_online(&self, online: bool) {
        self.manager.set_online(online);
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    pub fn facade(&self) -> &MutationFacade {
        &self.facade
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        self.manager.queue()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }
}
