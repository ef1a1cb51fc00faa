//! App - アプリケーション層
//!
//! このモジュールは、ports と queue を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **SessionBuilder / Session**: ワイヤリングと login/logout
//! - **MutationFacade**: UI 向けの変更操作（enqueue → 楽観的 apply）
//! - **QueueManager**: owner ごとの配送、リトライ、完了通知
//! - **Reconciler**: イベントストリームからローカル状態を収束させる
//! - **WriteGate**: owner ごとのローカル書き込みの直列化
//! - **FerryConfig / telemetry**: 設定とログ

pub mod config;
pub mod facade;
pub mod gate;
pub mod manager;
pub mod reconciler;
pub mod session;
pub mod status;
pub mod telemetry;

// 主要な型を再エクスポート
pub use self::config::{ConfigError, FerryConfig};
pub use self::facade::{MutationFacade, MutationReceipt, Selection};
pub use self::gate::WriteGate;
pub use self::manager::{QueueManager, TaskTicket};
pub use self::reconciler::{Reconciler, RefreshReport};
pub use self::session::{BuildError, Session, SessionBuilder};
pub use self::status::SessionStatus;
