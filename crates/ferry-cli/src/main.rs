use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Duration;

use ferry_core::app::{FerryConfig, MutationReceipt, Selection, SessionBuilder, SessionStatus, telemetry};
use ferry_core::domain::{EntityId, EntitySnapshot, OwnerId, RemoteError, Task, TaskId, TerminalStatus};
use ferry_core::impls::{InMemoryLocalStore, SimulatedServer};
use ferry_core::ports::RemoteExecutor;

/// 最初の n 回はタイムアウト扱いで失敗するリモート（リトライの様子を見るため）
struct FlakyRemote {
    inner: Arc<SimulatedServer>,
    remaining_failures: AtomicU32,
}

impl FlakyRemote {
    fn new(inner: Arc<SimulatedServer>, n: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl RemoteExecutor for FlakyRemote {
    async fn execute(&self, task: &Task) -> Result<(), RemoteError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(RemoteError::Transient(format!("simulated timeout (left={left})")));
        }
        self.inner.execute(task).await
    }
}

#[derive(Debug, Serialize)]
struct Outcome {
    what: &'static str,
    task_id: TaskId,
    status: Option<TerminalStatus>,
}

#[derive(Debug, Serialize)]
struct Report {
    outcomes: Vec<Outcome>,
    local: Vec<EntitySnapshot>,
    status: SessionStatus,
}

/// サンプルのメールボックス: 会話 c1（m1, m2）と c2、ローカルにだけ残っている ghost
fn seed(owner: &OwnerId, server: &SimulatedServer, local: &InMemoryLocalStore) {
    let c1 = EntitySnapshot::new(owner.clone(), "c1".into())
        .with_labels(["inbox"])
        .unread(true);
    let c2 = EntitySnapshot::new(owner.clone(), "c2".into()).with_labels(["inbox"]);
    let children = ["m1", "m2"].map(|id| {
        EntitySnapshot::new(owner.clone(), id.into())
            .with_parent("c1".into())
            .with_labels(["inbox"])
            .unread(true)
    });
    for snapshot in [c1, c2].into_iter().chain(children) {
        server.seed(snapshot.clone());
        local.seed(snapshot);
    }
    local.seed(EntitySnapshot::new(owner.clone(), "ghost".into()).with_labels(["inbox"]));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // (A) 設定（引数でファイルを指定しなければデフォルト）
    let config = match std::env::args().nth(1) {
        Some(path) => FerryConfig::load(path).await?,
        None => FerryConfig::default(),
    };
    telemetry::init(&config.logging.filter);

    // (B) 模擬サーバーとローカル状態を用意してセッションを組み立てる
    let owner = OwnerId::new("demo");
    let server = Arc::new(SimulatedServer::new().with_latency(Duration::from_millis(50)));
    let local = Arc::new(InMemoryLocalStore::new());
    seed(&owner, &server, &local);

    let session = SessionBuilder::new()
        .remote(Arc::new(FlakyRemote::new(server.clone(), 1)))
        .event_stream(server.clone())
        .local_store(local.clone())
        .queue_store(config.open_queue_store().await?)
        .with_config(&config)
        .build()?;
    let restored = session.login(&owner).await?;
    tracing::info!(pending = restored.counts.pending, "session ready");

    // (C) 変更を投入（ローカルには即反映、サーバーへは順番に送られる）
    let facade = session.facade();
    let read = facade
        .mark_read(Selection::conversations(owner.clone(), ["c1"]))
        .await?;
    let moved = facade
        .move_to(Selection::conversations(owner.clone(), ["c2"]), "inbox", "archive")
        .await?;
    let starred = facade
        .label(
            Selection::conversations(owner.clone(), ["c2"]).after(moved.task_id()),
            "starred",
        )
        .await?;
    let ghost = facade
        .delete(Selection::messages(owner.clone(), ["ghost"]).swipe(), "inbox")
        .await?;

    // (D) 完了を待つ（ticket はちょうど 1 回だけ解決される）
    let receipts: [(&'static str, MutationReceipt); 4] = [
        ("mark_read c1", read),
        ("move c2 to archive", moved),
        ("label c2 starred", starred),
        ("delete ghost", ghost),
    ];
    let mut outcomes = Vec::new();
    for (what, receipt) in receipts {
        let task_id = receipt.task_id();
        let status = receipt.wait().await;
        tracing::info!(what, task_id = %task_id, ?status, "finished");
        outcomes.push(Outcome {
            what,
            task_id,
            status,
        });
    }

    let ids: [EntityId; 5] = ["c1", "m1", "m2", "c2", "ghost"].map(Into::into);
    let report = Report {
        outcomes,
        local: facade.fetch_local(&owner, &ids).await?,
        status: session.status(&owner).await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    // (E) 後片付け
    session.logout(&owner).await?;
    session.shutdown();
    Ok(())
}
