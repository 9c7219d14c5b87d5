// 解压与解压上传任务
//
// 解压任务把存储里的 gzip 归档取到临时目录、解出内容文件，
// 然后向解压上传管理器提交上传任务，把产物放进目标目录。

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::UploadCache;
use crate::driver::{FileStream, LinkArgs, LocalFileStream, Obj, TaskContext, UpdateProgress};
use crate::task::{Task, TaskBase};

use super::env::TaskEnv;

/// 解压任务（取归档 + 解压）
#[derive(Serialize, Deserialize)]
pub struct ArchiveDownloadTask {
    #[serde(flatten)]
    pub base: Arc<TaskBase>,
    /// 存储中的归档对象（gzip）
    pub src: Obj,
    /// 解压产物的目标目录
    pub dst_dir: Obj,
    #[serde(skip)]
    env: OnceLock<Arc<TaskEnv>>,
}

impl ArchiveDownloadTask {
    pub fn new(src: Obj, dst_dir: Obj, env: Arc<TaskEnv>) -> Self {
        let task = Self {
            base: Arc::new(TaskBase::new()),
            src,
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

    /// 归档名去掉 .gz 后缀即产物名
    fn inner_name(&self) -> String {
        let name = if self.src.name.is_empty() {
            "archive"
        } else {
            &self.src.name
        };
        name.strip_suffix(".gz").unwrap_or(name).to_string()
    }
}

#[async_trait::async_trait]
impl Task for ArchiveDownloadTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn name(&self) -> String {
        format!("decompress [{}] to [{}]", self.src.path, self.dst_dir.path)
    }

    async fn run(&self) -> Result<()> {
        let env = self.env()?.clone();

        // 1. 取归档到临时目录
        self.base.set_status("fetching archive");
        self.base.set_total_bytes(self.src.size);
        let link = env.driver.link(&self.src, &LinkArgs::default()).await?;
        let archive_path = env
            .temp_dir
            .join(format!("archive-{}.gz", self.base.id()));
        let base = self.base.clone();
        env.fetch_url_to_file(
            &link.url,
            &archive_path,
            &self.base.cancel_token(),
            move |fetched, total| {
                if let Some(total) = total.filter(|t| *t > 0) {
                    // 取档占进度前一半
                    base.set_progress(50.0 * fetched as f64 / total as f64);
                }
            },
        )
        .await?;

        // 2. 解压到临时目录
        self.base.set_status("decompressing");
        let output_path = env
            .temp_dir
            .join(format!("extracted-{}-{}", self.base.id(), self.inner_name()));
        let archive = archive_path.clone();
        let output = output_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&archive)
                .with_context(|| format!("打开归档失败: {:?}", archive))?;
            let mut decoder = GzDecoder::new(std::io::BufReader::new(file));
            let mut out = std::fs::File::create(&output)
                .with_context(|| format!("创建解压输出失败: {:?}", output))?;
            std::io::copy(&mut decoder, &mut out).context("解压归档失败")?;
            Ok(())
        })
        .await??;
        let _ = tokio::fs::remove_file(&archive_path).await;
        self.base.set_progress(100.0);

        // 3. 产物交给解压上传管理器
        let manager = self
            .env()?
            .archive_upload_manager()
            .context("解压上传管理器未初始化")?;
        let upload = ArchiveContentUploadTask::new(output_path, self.dst_dir.clone(), env);
        upload.base.set_creator(self.base.creator());
        let tid = manager.submit(upload).await;
        info!("解压完成，已提交上传任务: {}", tid);
        Ok(())
    }
}

/// 解压产物上传任务
#[derive(Serialize, Deserialize)]
pub struct ArchiveContentUploadTask {
    #[serde(flatten)]
    pub base: Arc<TaskBase>,
    /// 临时目录中的解压产物
    pub file_path: PathBuf,
    /// 目标目录
    pub dst_dir: Obj,
    #[serde(skip)]
    env: OnceLock<Arc<TaskEnv>>,
    #[serde(skip)]
    cache: OnceLock<Arc<UploadCache>>,
}

impl ArchiveContentUploadTask {
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
impl Task for ArchiveContentUploadTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn name(&self) -> String {
        let file = self
            .file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        format!("upload extracted {} to [{}]", file, self.dst_dir.path)
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
        self.base.set_status("uploading");

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
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_decompress_chain() {
        let dir = TempDir::new().unwrap();

        // 准备一个 gzip 归档，StubApi 的直链直接指向它
        let archive = dir.path().join("notes.txt.gz");
        let mut encoder = GzEncoder::new(
            std::fs::File::create(&archive).unwrap(),
            Compression::default(),
        );
        encoder.write_all(b"compressed content").unwrap();
        encoder.finish().unwrap();

        let api = Arc::new(StubApi::new(1024));
        let env = Arc::new(TaskEnv::new(
            Arc::new(PolarDriver::with_api(api.clone())),
            dir.path().to_path_buf(),
        ));
        let upload_manager: Arc<TaskManager<ArchiveContentUploadTask>> =
            TaskManager::new("decompress_upload", ManagerConfig::default()).await;
        env.set_archive_upload_manager(upload_manager.clone());

        let src = Obj {
            id: archive.display().to_string(),
            name: "notes.txt.gz".to_string(),
            path: "/archives/notes.txt.gz".to_string(),
            size: 64,
            ..Default::default()
        };
        let task = ArchiveDownloadTask::new(src, Obj::dir("d1", "/dst"), env);
        task.base.set_id("ad-1");
        task.run().await.unwrap();

        // 上传任务已提交并完成，产物内容为解压后的明文
        let uploads = upload_manager.get_all();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].name().contains("notes.txt"));
        for _ in 0..300 {
            if uploads[0].base.state() == TaskState::Succeeded {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(uploads[0].base.state(), TaskState::Succeeded);
        assert!(api.part_count() > 0);
    }

    #[test]
    fn test_inner_name_strips_gz() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(TaskEnv::new(
            Arc::new(PolarDriver::with_api(Arc::new(StubApi::new(1024)))),
            dir.path().to_path_buf(),
        ));
        let task = ArchiveDownloadTask::new(
            Obj {
                name: "logs.tar.gz".to_string(),
                ..Default::default()
            },
            Obj::dir("d", "/x"),
            env,
        );
        assert_eq!(task.inner_name(), "logs.tar");
    }
}
