//! Impls - ポートの実装
//!
//! In-memory backends for development and tests, plus the reqwest-based
//! HTTP dispatcher used in production.

pub mod http_dispatch;
pub mod inmem_coordination;
pub mod inmem_lock;
pub mod inmem_task_store;
pub mod static_discovery;
pub mod stub_dispatch;

pub use self::http_dispatch::HttpDispatcher;
pub use self::inmem_coordination::{InMemoryCoordinator, InMemorySession};
pub use self::inmem_lock::InMemoryLockStore;
pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::static_discovery::StaticDiscovery;
pub use self::stub_dispatch::{RecordedCall, StubDispatcher};
