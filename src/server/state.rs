// 应用状态

use std::sync::Arc;

use crate::config::AppConfig;
use crate::persistence::TaskDb;
use crate::task::TaskManager;
use crate::tasks::{
    ArchiveContentUploadTask, ArchiveDownloadTask, DownloadTask, FileTransferTask, TaskEnv,
    TransferTask, UploadTask,
};

/// 七类任务的管理器集合
#[derive(Clone)]
pub struct Managers {
    pub upload: Arc<TaskManager<UploadTask>>,
    pub copy: Arc<TaskManager<FileTransferTask>>,
    pub mv: Arc<TaskManager<FileTransferTask>>,
    pub download: Arc<TaskManager<DownloadTask>>,
    pub transfer: Arc<TaskManager<TransferTask>>,
    pub decompress: Arc<TaskManager<ArchiveDownloadTask>>,
    pub decompress_upload: Arc<TaskManager<ArchiveContentUploadTask>>,
}

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    pub managers: Managers,
    pub db: Arc<TaskDb>,
    pub env: Arc<TaskEnv>,
    pub config: Arc<AppConfig>,
}
