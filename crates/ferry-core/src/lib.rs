//! ferry-core
//!
//! Offline mutation queue with optimistic apply.
//!
//! 変更はまず owner ごとの永続キューに積まれ、すぐにローカル状態へ楽観的に適用されます。
//! キューはサーバーへ順番に送り出し、完了後にイベントストリームからローカル状態を正本へ収束させます。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, snapshot, events, errors）
//! - **ports**: 抽象化レイヤー（RemoteExecutor, LocalStore, EventStream, QueueStore, Clock, IdGenerator）
//! - **queue**: TaskQueue（owner ごとの lane, 依存グラフ, リトライポリシー）
//! - **app**: Session, MutationFacade, QueueManager, Reconciler, 設定とログ
//! - **impls**: 実装（インメモリ / JSON ファイル / 模擬サーバー）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
