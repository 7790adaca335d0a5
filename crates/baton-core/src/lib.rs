//! baton-core
//!
//! Leader-gated distributed task queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, instance, errors）
//! - **ports**: 抽象化レイヤー（CoordinationClient, TaskStore, LockStore, Dispatcher, Clock, など）
//! - **discovery**: サービス登録の監視とリーダー選出
//! - **app**: キューのロジック（builder, worker_loop, compensator, service）
//! - **impls**: 実装（インメモリ実装と reqwest ベースの HTTP dispatcher）
//! - **config**: ノード設定

pub mod app;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod impls;
pub mod ports;
