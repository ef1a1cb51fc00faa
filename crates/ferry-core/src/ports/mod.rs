//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（サーバー API、ローカル DB、キューの永続化先）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - サーバーが source of truth（正本）
//! - LocalStore は楽観的な投影で、Reconciler が正本に収束させる
//! - QueueStore は未送信のタスクを再起動後も失わないための保存先

pub mod clock;
pub mod event_stream;
pub mod id_generator;
pub mod local_store;
pub mod queue_store;
pub mod remote;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_stream::EventStream;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::local_store::LocalStore;
pub use self::queue_store::QueueStore;
pub use self::remote::RemoteExecutor;
