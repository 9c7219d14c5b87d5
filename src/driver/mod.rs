// 存储驱动抽象
//
// 核心只依赖这里的抽象面；具体后端适配器按此契约接入。
// put 通过 TaskContext 携带取消信号与可选的上传缓存。

pub mod limited;
pub mod stream;

pub use limited::LimitedUploadStream;
pub use stream::{FileStream, HashAlg, LocalFileStream};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::UploadCache;

/// 存储对象
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Obj {
    /// 后端对象 ID
    pub id: String,
    /// 对象名
    pub name: String,
    /// 挂载内路径
    pub path: String,
    /// 字节大小（目录为 0）
    pub size: i64,
    /// 是否为目录
    pub is_dir: bool,
    /// 修改时间
    pub modified: Option<DateTime<Utc>>,
}

impl Obj {
    pub fn dir(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            is_dir: true,
            ..Default::default()
        }
    }
}

/// 列表参数
#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    /// 跳过缓存强制刷新
    pub refresh: bool,
}

/// 取直链参数
#[derive(Debug, Clone, Default)]
pub struct LinkArgs {
    /// 是否允许重定向地址
    pub redirect: bool,
}

/// 下载直链
#[derive(Debug, Clone)]
pub struct Link {
    pub url: String,
}

/// 容量信息
#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub used: u64,
    pub total: u64,
}

impl DiskUsage {
    pub fn from_used_and_total(used: u64, total: u64) -> Self {
        Self { used, total }
    }
}

/// 存储详情
#[derive(Debug, Clone)]
pub struct StorageDetails {
    pub disk_usage: DiskUsage,
}

/// 进度回调（0-100）
pub type UpdateProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// 不需要进度时的空回调
pub fn noop_progress() -> UpdateProgress {
    Arc::new(|_| {})
}

/// 执行上下文
///
/// 取消信号由任务管理器派发；上传缓存在一条逻辑上传的
/// 多次重试之间共享。
#[derive(Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
    upload_cache: Option<Arc<UploadCache>>,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            upload_cache: None,
        }
    }

    pub fn with_upload_cache(mut self, cache: Arc<UploadCache>) -> Self {
        self.upload_cache = Some(cache);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn upload_cache(&self) -> Option<Arc<UploadCache>> {
        self.upload_cache.clone()
    }
}

/// 存储驱动契约
#[async_trait]
pub trait Driver: Send + Sync {
    /// 初始化（鉴权、配置校验）
    async fn init(&self) -> Result<()>;

    /// 释放资源
    async fn drop_storage(&self) -> Result<()>;

    async fn list(&self, dir: &Obj, args: &ListArgs) -> Result<Vec<Obj>>;

    async fn link(&self, file: &Obj, args: &LinkArgs) -> Result<Link>;

    async fn make_dir(&self, parent: &Obj, name: &str) -> Result<()>;

    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> Result<()>;

    async fn rename(&self, src: &Obj, new_name: &str) -> Result<()>;

    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> Result<()>;

    async fn remove(&self, obj: &Obj) -> Result<()>;

    /// 上传一个流到目标目录
    async fn put(
        &self,
        ctx: &TaskContext,
        dst_dir: &Obj,
        stream: &mut dyn FileStream,
        progress: UpdateProgress,
    ) -> Result<()>;

    async fn get_details(&self) -> Result<StorageDetails>;
}
