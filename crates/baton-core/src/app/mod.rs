//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてキューのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **QueueBuilder**: キューの構築と起動時検証
//! - **TaskWorker / WorkerGroup**: タスク実行ループ（lock→claim→dispatch→persist→unlock）
//! - **Compensator**: 放置された Executing タスクの回収
//! - **TaskService**: タスクの投入と照会

pub mod backoff;
pub mod builder;
pub mod compensator;
pub mod context;
pub mod service;
pub mod status;
pub mod worker_loop;

#[cfg(test)]
pub(crate) mod testkit;

// 主要な型を再エクスポート
pub use self::backoff::{BackoffPolicy, PollPolicy};
pub use self::builder::{BuildError, QueueBuilder, TaskQueue};
pub use self::compensator::{CompensationReport, Compensator};
pub use self::context::QueueContext;
pub use self::service::{CreateTaskRequest, TaskService};
pub use self::status::QueueCounts;
pub use self::worker_loop::{ItemOutcome, PassOutcome, PassReport, TaskType, TaskWorker, WorkerGroup};
