//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。協調サービス、タスクストア、分散ロック、
//! ダウンストリーム呼び出しはすべてここの trait 越しに使う。
//! 開発・テスト用の実装は `impls` にある。

pub mod clock;
pub mod coordination;
pub mod discovery;
pub mod dispatch;
pub mod id_generator;
pub mod lock_store;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::coordination::{
    ChildrenWatch, CoordinationClient, Leadership, ValueWatch, WatchEvent,
};
pub use self::discovery::ServiceDiscovery;
pub use self::dispatch::{Dispatcher, HttpMethod, Route};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock_store::LockStore;
pub use self::task_store::{
    FindOptions, SortOrder, SubTaskPatch, TaskFilter, TaskStore, TaskUpdate,
};
