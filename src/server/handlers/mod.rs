// API 处理器

pub mod fs;
pub mod task;

pub use task::{task_routes, KindState, PageResp};
