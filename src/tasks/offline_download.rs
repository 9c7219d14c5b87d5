// 离线下载与转存任务
//
// 离线下载先把远端内容取到临时目录，完成后向转存管理器提交
// 转存任务，由转存任务把文件上传进目标存储并清理临时文件。

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::UploadCache;
use crate::driver::{FileStream, LocalFileStream, Obj, TaskContext, UpdateProgress};
use crate::task::{Task, TaskBase};

use super::env::TaskEnv;

/// 离线下载任务
#[derive(Serialize, Deserialize)]
pub struct DownloadTask {
    #[serde(flatten)]
    pub base: Arc<TaskBase>,
    /// 下载源地址
    pub url: String,
    /// 转存目标目录
    pub dst_dir: Obj,
    #[serde(skip)]
    env: OnceLock<Arc<TaskEnv>>,
}

impl DownloadTask {
    pub fn new(url: String, dst_dir: Obj, env: Arc<TaskEnv>) -> Self {
        let task = Self {
            base: Arc::new(TaskBase::new()),
            url,
            dst_dir,
            env: OnceLock::new(),
        };
        let _ = task.env.set(env);
        task
    }

    pub fn attach_env(&self, env: Arc<TaskEnv>) {
        let _ = self.env.set(env);
    }

    fn env(&self) -> Result<&Arc<TaskEnv>> {
        self.env.get().context("任务环境未初始化")
    }

    /// 从 URL 推导落盘文件名
    fn file_name(&self) -> String {
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download.bin")
            .to_string()
    }
}

#[async_trait::async_trait]
impl Task for DownloadTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn name(&self) -> String {
        format!("download {} to [{}]", self.url, self.dst_dir.path)
    }

    async fn run(&self) -> Result<()> {
        let env = self.env()?.clone();
        let temp_path = env
            .temp_dir
            .join(format!("offline-{}-{}", self.base.id(), self.file_name()));

        self.base.set_status("downloading");
        let base = self.base.clone();
        env.fetch_url_to_file(
            &self.url,
            &temp_path,
            &self.base.cancel_token(),
            move |fetched, total| {
                if let Some(total) = total.filter(|t| *t > 0) {
                    base.set_total_bytes(total as i64);
                    base.set_progress(100.0 * fetched as f64 / total as f64);
                }
            },
        )
        .await?;

        // 下载完成，交给转存管理器搬进目标存储
        let manager = self
            .env()?
            .transfer_manager()
            .context("转存管理器未初始化")?;
        let transfer = TransferTask::new(temp_path, self.dst_dir.clone(), env);
        transfer.base.set_creator(self.base.creator());
        let tid = manager.submit(transfer).await;
        info!("离线下载完成，已提交转存任务: {}", tid);
        Ok(())
    }
}

/// 离线下载转存任务
#[derive(Serialize, Deserialize)]
pub struct TransferTask {
    #[serde(flatten)]
    pub base: Arc<TaskBase>,
    /// 临时目录中待转存的文件
    pub file_path: PathBuf,
    /// 目标目录
    pub dst_dir: Obj,
    #[serde(skip)]
    env: OnceLock<Arc<TaskEnv>>,
    #[serde(skip)]
    cache: OnceLock<Arc<UploadCache>>,
}

impl TransferTask {
    pub fn new(file_path: PathBuf, dst_dir: Obj, env: Arc<TaskEnv>) -> Self {
        let task = Self {
            base: Arc::new(TaskBase::new()),
            file_path,
            dst_dir,
            env: OnceLock::new(),
            cache: OnceLock::new(),
        };
        let _ = task.env.set(env);
        task
    }

    pub fn attach_env(&self, env: Arc<TaskEnv>) {
        let _ = self.env.set(env);
    }

    fn env(&self) -> Result<&Arc<TaskEnv>> {
        self.env.get().context("任务环境未初始化")
    }
}

#[async_trait::async_trait]
impl Task for TransferTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn name(&self) -> String {
        let file = self
            .file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        format!("transfer {} to [{}]", file, self.dst_dir.path)
    }

    async fn run(&self) -> Result<()> {
        let env = self.env()?.clone();
        let cache = self
            .cache
            .get_or_init(|| {
                Arc::new(
                    UploadCache::new(None).with_metadata_key(&env.temp_dir, &self.base.id()),
                )
            })
            .clone();
        cache.register_temp(&self.file_path);

        let mut stream = LocalFileStream::open(&self.file_path).await?;
        self.base.set_total_bytes(stream.size() as i64);
        self.base.set_status("transferring");

        let ctx = TaskContext::new(self.base.cancel_token()).with_upload_cache(cache.clone());
        let progress: UpdateProgress = {
            let base = self.base.clone();
            Arc::new(move |p| base.set_progress(p))
        };
        env.driver
            .put(&ctx, &self.dst_dir, &mut stream, progress)
            .await?;

        if !cache.should_retain_metadata() {
            let _ = cache.remove_metadata_file();
        }
        if !cache.should_keep(&self.file_path) {
            let _ = tokio::fs::remove_file(&self.file_path).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::polar::driver::tests_support::StubApi;
    use crate::drivers::polar::PolarDriver;
    use crate::task::{ManagerConfig, TaskManager, TaskState};
    use tempfile::TempDir;

    fn env_with_stub(dir: &TempDir, api: Arc<StubApi>) -> Arc<TaskEnv> {
        Arc::new(TaskEnv::new(
            Arc::new(PolarDriver::with_api(api)),
            dir.path().to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn test_download_then_transfer_chain() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("remote.bin");
        std::fs::write(&src, vec![8u8; 2048]).unwrap();

        let api = Arc::new(StubApi::new(1024));
        let env = env_with_stub(&dir, api.clone());
        let transfer_manager: Arc<TaskManager<TransferTask>> =
            TaskManager::new("transfer", ManagerConfig::default()).await;
        env.set_transfer_manager(transfer_manager.clone());

        let task = DownloadTask::new(
            format!("file://{}", src.display()),
            Obj::dir("d1", "/dst"),
            env,
        );
        task.base.set_id("dl-1");
        task.run().await.unwrap();

        // 转存任务已提交并最终完成上传
        let all = transfer_manager.get_all();
        assert_eq!(all.len(), 1);
        for _ in 0..300 {
            if all[0].base.state() == TaskState::Succeeded {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(all[0].base.state(), TaskState::Succeeded);
        assert!(api.part_count() > 0);
    }

    #[tokio::test]
    async fn test_transfer_task_uploads_and_cleans() {
        let dir = TempDir::new().unwrap();
        let payload = dir.path().join("staged.bin");
        std::fs::write(&payload, vec![7u8; 4096]).unwrap();

        let env = env_with_stub(&dir, Arc::new(StubApi::new(1024)));
        let task = TransferTask::new(payload.clone(), Obj::dir("d1", "/dst"), env);
        task.base.set_id("tr-1");
        task.run().await.unwrap();

        assert!(!payload.exists());
        assert_eq!(task.base.total_bytes(), 4096);
    }

    #[test]
    fn test_download_file_name() {
        let dir = TempDir::new().unwrap();
        let env = env_with_stub(&dir, Arc::new(StubApi::new(1024)));
        let task = DownloadTask::new(
            "https://mirror.example.com/iso/disk.iso".to_string(),
            Obj::dir("d1", "/dst"),
            env,
        );
        assert_eq!(task.file_name(), "disk.iso");
    }
}
