// 持久化层
//
// 快照表 + 索引表双写，外加旧版 task_items 兼容。

pub mod hooks;
pub mod signal;
pub mod store;

pub use hooks::{task_persist_read_fn, task_persist_write_fn};
pub use signal::LoadSignal;
pub use store::{TaskDb, TaskRecordRow, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
