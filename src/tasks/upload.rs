// 上传任务
//
// HTTP 层先把请求体落到临时文件再提交任务；执行器按任务 ID
// 固定旁车元数据位置，重试之间复用同一个上传缓存。

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::UploadCache;
use crate::driver::{FileStream, LocalFileStream, Obj, TaskContext, UpdateProgress};
use crate::task::{Task, TaskBase};

use super::env::TaskEnv;

/// 上传任务
#[derive(Serialize, Deserialize)]
pub struct UploadTask {
    #[serde(flatten)]
    pub base: Arc<TaskBase>,
    /// 本地临时文件（请求体已落盘）
    pub file_path: PathBuf,
    /// 目标文件名
    pub file_name: String,
    /// 目标目录
    pub dst_dir: Obj,
    #[serde(skip)]
    env: OnceLock<Arc<TaskEnv>>,
    #[serde(skip)]
    cache: OnceLock<Arc<UploadCache>>,
}

impl UploadTask {
    pub fn new(file_path: PathBuf, file_name: String, dst_dir: Obj, env: Arc<TaskEnv>) -> Self {
        let task = Self {
            base: Arc::new(TaskBase::new()),
            file_path,
            file_name,
            dst_dir,
            env: OnceLock::new(),
            cache: OnceLock::new(),
        };
        let _ = task.env.set(env);
        task
    }

    /// 恢复钩子用：重新挂接运行环境
    pub fn attach_env(&self, env: Arc<TaskEnv>) {
        let _ = self.env.set(env);
    }

    fn env(&self) -> Result<&Arc<TaskEnv>> {
        self.env.get().context("任务环境未初始化")
    }
}

#[async_trait::async_trait]
impl Task for UploadTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn name(&self) -> String {
        format!("upload {} to {}", self.file_name, self.dst_dir.path)
    }

    async fn run(&self) -> Result<()> {
        let env = self.env()?.clone();

        // 同一逻辑上传的重试共享缓存，旁车位置按任务 ID 固定
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
        self.base.set_status("uploading");

        let ctx = TaskContext::new(self.base.cancel_token()).with_upload_cache(cache.clone());
        let progress: UpdateProgress = {
            let base = self.base.clone();
            Arc::new(move |p| base.set_progress(p))
        };
        env.driver
            .put(&ctx, &self.dst_dir, &mut stream, progress)
            .await?;

        // 成功后缓存允许回收
        if !cache.should_retain_metadata() {
            if let Err(e) = cache.remove_metadata_file() {
                warn!("删除上传元数据失败: {}", e);
            }
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
    use crate::cache::metadata_path_for_key;
    use crate::drivers::polar::driver::tests_support::StubApi;
    use crate::drivers::polar::PolarDriver;
    use tempfile::TempDir;

    fn env_with_stub(dir: &TempDir, api: Arc<StubApi>) -> Arc<TaskEnv> {
        Arc::new(TaskEnv::new(
            Arc::new(PolarDriver::with_api(api)),
            dir.path().to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn test_upload_task_success_cleans_up() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("payload.bin");
        std::fs::write(&src, vec![5u8; 2048]).unwrap();

        let api = Arc::new(StubApi::new(1024));
        let env = env_with_stub(&dir, api.clone());
        let task = UploadTask::new(
            src.clone(),
            "payload.bin".to_string(),
            Obj::dir("d1", "/dst"),
            env,
        );
        task.base.set_id("up-1");

        task.run().await.unwrap();

        // 成功后临时文件与旁车元数据都已清理
        assert!(!src.exists());
        assert!(!metadata_path_for_key(dir.path(), "up-1").exists());
        assert_eq!(task.base.total_bytes(), 2048);
        assert!(api.part_count() > 0);
    }

    #[tokio::test]
    async fn test_upload_task_failure_keeps_temp() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("payload.bin");
        std::fs::write(&src, vec![6u8; 2048]).unwrap();

        let api = Arc::new(StubApi::failing_at_part(1024, 2));
        let env = env_with_stub(&dir, api);
        let task = UploadTask::new(
            src.clone(),
            "payload.bin".to_string(),
            Obj::dir("d1", "/dst"),
            env,
        );
        task.base.set_id("up-2");

        task.run().await.unwrap_err();

        // 失败后临时文件保留，旁车元数据在任务 ID 固定位置等待重试
        assert!(src.exists());
        assert!(metadata_path_for_key(dir.path(), "up-2").exists());
    }
}
