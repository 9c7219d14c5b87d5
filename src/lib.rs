// 网盘文件任务编排核心库
// 多租户长任务调度、双表持久化与断点续传上传

// 启动装配
pub mod bootstrap;

// 上传缓存
pub mod cache;

// 配置管理
pub mod config;

// 存储驱动抽象
pub mod driver;

// 具体后端驱动
pub mod drivers;

// 日志系统
pub mod logging;

// 持久化层
pub mod persistence;

// Web 服务器
pub mod server;

// 任务模型与调度
pub mod task;

// 具体任务类型
pub mod tasks;

// 导出常用类型
pub use cache::{UploadCache, UploadMetadata};
pub use config::AppConfig;
pub use persistence::{LoadSignal, TaskDb};
pub use server::{AppState, CurrentUser, Managers};
pub use task::{Creator, TaskManager, TaskState, TaskView};
