// 任务运行环境
//
// 具体任务经 serde 往返后丢失运行时依赖（驱动句柄、临时目录、
// 下游管理器），由管理器的恢复钩子重新挂接。

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::Driver;
use crate::task::TaskManager;

use super::decompress::ArchiveContentUploadTask;
use super::offline_download::TransferTask;

/// 任务共享环境
pub struct TaskEnv {
    /// 目标存储驱动
    pub driver: Arc<dyn Driver>,
    /// 临时目录
    pub temp_dir: PathBuf,
    /// 离线下载用 HTTP 客户端
    pub http: reqwest::Client,
    /// 离线下载完成后的转存管理器
    transfer: OnceLock<Arc<TaskManager<TransferTask>>>,
    /// 解压产物的上传管理器
    archive_upload: OnceLock<Arc<TaskManager<ArchiveContentUploadTask>>>,
}

impl TaskEnv {
    pub fn new(driver: Arc<dyn Driver>, temp_dir: PathBuf) -> Self {
        Self {
            driver,
            temp_dir,
            http: reqwest::Client::new(),
            transfer: OnceLock::new(),
            archive_upload: OnceLock::new(),
        }
    }

    /// 注入转存管理器（bootstrap 在管理器建好后调用一次）
    pub fn set_transfer_manager(&self, manager: Arc<TaskManager<TransferTask>>) {
        let _ = self.transfer.set(manager);
    }

    pub fn transfer_manager(&self) -> Option<Arc<TaskManager<TransferTask>>> {
        self.transfer.get().cloned()
    }

    /// 注入解压上传管理器
    pub fn set_archive_upload_manager(
        &self,
        manager: Arc<TaskManager<ArchiveContentUploadTask>>,
    ) {
        let _ = self.archive_upload.set(manager);
    }

    pub fn archive_upload_manager(&self) -> Option<Arc<TaskManager<ArchiveContentUploadTask>>> {
        self.archive_upload.get().cloned()
    }

    /// 把 URL 指向的内容取到本地文件
    ///
    /// 支持 `http(s)://` 与存储驱动直链常见的 `file://`。
    /// 每个数据块之间检查取消信号，`on_chunk` 上报已取字节数。
    pub async fn fetch_url_to_file(
        &self,
        url: &str,
        dst: &Path,
        cancel: &CancellationToken,
        on_chunk: impl Fn(u64, Option<u64>),
    ) -> Result<()> {
        if let Some(local) = url.strip_prefix("file://") {
            let total = tokio::fs::metadata(local).await.ok().map(|m| m.len());
            tokio::fs::copy(local, dst)
                .await
                .with_context(|| format!("复制本地直链失败: {}", local))?;
            if let Some(total) = total {
                on_chunk(total, Some(total));
            }
            return Ok(());
        }

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("请求下载源失败: {}", url))?
            .error_for_status()
            .context("下载源返回错误状态")?;
        let total = resp.content_length();

        let mut file = tokio::fs::File::create(dst)
            .await
            .with_context(|| format!("创建临时文件失败: {:?}", dst))?;
        let mut fetched: u64 = 0;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            if cancel.is_cancelled() {
                anyhow::bail!("任务已取消");
            }
            let chunk = chunk.context("读取下载流失败")?;
            file.write_all(&chunk).await?;
            fetched += chunk.len() as u64;
            on_chunk(fetched, total);
        }
        file.flush().await?;
        debug!("下载完成: {} -> {:?} ({} 字节)", url, dst, fetched);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::polar::PolarDriver;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn test_env(temp_dir: &Path) -> TaskEnv {
        // 离线 API 客户端不会被这些测试触发
        let client = crate::drivers::polar::PolarClient::new("http://localhost:0", "t").unwrap();
        TaskEnv::new(Arc::new(PolarDriver::new(client)), temp_dir.to_path_buf())
    }

    #[tokio::test]
    async fn test_fetch_file_url() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"local payload").unwrap();

        let env = test_env(dir.path());
        let dst = dir.path().join("dst.bin");
        let seen: Arc<Mutex<Vec<u64>>> = Arc::default();
        let sink = seen.clone();
        env.fetch_url_to_file(
            &format!("file://{}", src.display()),
            &dst,
            &CancellationToken::new(),
            move |n, _| sink.lock().unwrap().push(n),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"local payload");
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 13);
    }
}
