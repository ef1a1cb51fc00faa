//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryQueueStore**: プロセス内だけのキュー保存先
//! - **JsonFileQueueStore**: owner ごとの JSON ファイル（atomic rename）
//! - **InMemoryLocalStore**: 楽観的ローカル状態
//! - **SimulatedServer**: RemoteExecutor + EventStream の模擬サーバー
//!
//! # 本番用実装
//! HTTP クライアントや実 DB の実装は別クレートに置く想定です。

pub mod file_store;
pub mod memory_local;
pub mod memory_store;
pub mod simulated;

pub use self::file_store::JsonFileQueueStore;
pub use self::memory_local::InMemoryLocalStore;
pub use self::memory_store::InMemoryQueueStore;
pub use self::simulated::{JournalEntry, SimulatedServer};
