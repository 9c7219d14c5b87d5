// Polar 驱动实现
//
// 上传状态机：
// 1. 哈希补全（上传缓存命中时跳过重算）
// 2. pre 预创建，拿到 task_id 与分片大小
// 3. hash 秒传检查，命中直接完成
// 4. 顺序分片上传，收集分片 MD5，哨兵 "finish" 提前结束
// 5. commit 提交 MD5 列表，finish 收尾
//
// 重试保留规则：哈希补全之后的任何失败都把临时文件标记为保留，
// 让下一次尝试可以凭旁车元数据跳过重算；哈希补全阶段本身失败时
// 缓存内容不完整，不做保留。

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cache::{UploadCache, UploadMetadata};
use crate::driver::{
    DiskUsage, Driver, FileStream, HashAlg, LimitedUploadStream, Link, LinkArgs, ListArgs, Obj,
    StorageDetails, TaskContext, UpdateProgress,
};

use super::client::{PartBody, PolarApi, PolarClient, PART_FINISH_SENTINEL};

/// 旁车元数据中 SHA1 的扩展键
pub const POLAR_META_SHA1_KEY: &str = "polar_sha1";

/// Polar 网盘驱动
pub struct PolarDriver {
    api: Arc<dyn PolarApi>,
    /// 上传限速（字节/秒），None 不限速
    upload_rate_limit: Option<u64>,
}

impl PolarDriver {
    pub fn new(client: PolarClient) -> Self {
        Self::with_api(Arc::new(client))
    }

    pub fn with_api(api: Arc<dyn PolarApi>) -> Self {
        Self {
            api,
            upload_rate_limit: None,
        }
    }

    pub fn with_upload_rate_limit(mut self, bytes_per_second: Option<u64>) -> Self {
        self.upload_rate_limit = bytes_per_second;
        self
    }

    /// 哈希补全
    ///
    /// 优先级：流自带哈希 > 缓存元数据（大小一致且 MD5 齐全）> 整读重算。
    /// 重算后的哈希写回旁车元数据，SHA1 记在扩展键下。
    async fn resolve_hashes(
        &self,
        ctx: &TaskContext,
        stream: &mut dyn FileStream,
    ) -> Result<(String, String)> {
        let mut md5 = stream
            .get_hash(HashAlg::Md5)
            .filter(|h| h.len() == HashAlg::Md5.width());
        let mut sha1 = stream
            .get_hash(HashAlg::Sha1)
            .filter(|h| h.len() == HashAlg::Sha1.width());

        let cache = ctx.upload_cache();
        if md5.is_none() || sha1.is_none() {
            if let Some(cache) = &cache {
                if let Ok(meta) = cache.load_metadata() {
                    let sha1_extra = meta.get_extra(POLAR_META_SHA1_KEY);
                    let usable = meta.size == stream.size() as i64
                        && !meta.content_md5.is_empty()
                        && (sha1.is_some() || !sha1_extra.is_empty());
                    if usable {
                        if md5.is_none() {
                            md5 = Some(meta.content_md5.clone());
                        }
                        if sha1.is_none() && !sha1_extra.is_empty() {
                            sha1 = Some(sha1_extra);
                        }
                    }
                }
            }
        }

        if md5.is_none() || sha1.is_none() {
            // 组合 writer：一次通读同时补齐缺失的摘要
            let mut hasher = TeeHasher {
                md5: md5.is_none().then(md5::Context::new),
                sha1: sha1.is_none().then(Sha1::new),
            };
            stream
                .cache_full_and_tee(&mut hasher)
                .await
                .context("缓存上传流并计算哈希失败")?;
            if let Some(c) = hasher.md5.take() {
                md5 = Some(format!("{:x}", c.compute()));
            }
            if let Some(s) = hasher.sha1.take() {
                sha1 = Some(hex_digest(&s.finalize()));
            }

            if let Some(cache) = &cache {
                let mut meta = UploadMetadata {
                    size: stream.size() as i64,
                    content_md5: md5.clone().unwrap_or_default(),
                    ..Default::default()
                };
                meta.set_extra(POLAR_META_SHA1_KEY, sha1.as_deref().unwrap_or(""));
                if let Err(e) = cache.save_metadata(Some(&meta)) {
                    warn!("[polar] 保存上传元数据失败: {}", e);
                }
            }
        }

        Ok((md5.unwrap_or_default(), sha1.unwrap_or_default()))
    }

    /// 哈希就绪后的上传主体
    async fn upload_resolved(
        &self,
        ctx: &TaskContext,
        dst_dir: &Obj,
        stream: &mut dyn FileStream,
        md5: &str,
        sha1: &str,
        progress: UpdateProgress,
    ) -> Result<()> {
        // pre
        let pre = self
            .api
            .up_pre(dst_dir, &stream.name(), stream.size())
            .await
            .context("预创建上传任务失败")?;
        debug!("[polar] hash: {} {}", md5, sha1);

        // hash 秒传
        if self.api.up_hash(&pre.task_id, md5, sha1).await? {
            return Ok(());
        }

        // 分片循环
        let total = stream.size();
        let mut left = total;
        let part_size = pre.part_size.max(1);
        let mimetype = stream.mimetype();
        let count = total.div_ceil(part_size) as usize;
        let mut md5s = Vec::with_capacity(count);
        let mut part_number = 1usize;
        let mut part = vec![0u8; part_size as usize];

        while left > 0 {
            if ctx.is_canceled() {
                anyhow::bail!("任务已取消");
            }
            let n = part_size.min(left) as usize;
            stream
                .read_exact(&mut part[..n])
                .await
                .with_context(|| format!("读取分片 {} 失败", part_number))?;
            left -= n as u64;

            let reader = LimitedUploadStream::new(
                ctx.cancel_token(),
                std::io::Cursor::new(part[..n].to_vec()),
            )
            .with_limit(self.upload_rate_limit);
            let m = self
                .api
                .up_part(
                    &pre.task_id,
                    &mimetype,
                    part_number,
                    PartBody::new(reader, n as u64),
                )
                .await?;
            if m == PART_FINISH_SENTINEL {
                return Ok(());
            }
            md5s.push(m);
            part_number += 1;
            progress(100.0 * (total - left) as f64 / total as f64);
        }

        // commit + finish
        self.api.up_commit(&pre.task_id, &md5s).await?;
        self.api.up_finish(&pre.task_id).await
    }
}

/// 组合哈希 writer
struct TeeHasher {
    md5: Option<md5::Context>,
    sha1: Option<Sha1>,
}

impl Write for TeeHasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(md5) = &mut self.md5 {
            md5.consume(buf);
        }
        if let Some(sha1) = &mut self.sha1 {
            sha1.update(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl Driver for PolarDriver {
    async fn init(&self) -> Result<()> {
        self.api.member_info().await.map(|_| ())
    }

    async fn drop_storage(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self, dir: &Obj, _args: &ListArgs) -> Result<Vec<Obj>> {
        self.api.list_files(&dir.id).await
    }

    async fn link(&self, file: &Obj, _args: &LinkArgs) -> Result<Link> {
        let url = self.api.download_link(&file.id).await?;
        Ok(Link { url })
    }

    async fn make_dir(&self, parent: &Obj, name: &str) -> Result<()> {
        self.api.make_dir(&parent.id, name).await
    }

    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> Result<()> {
        self.api.move_file(&src.id, &dst_dir.id).await
    }

    async fn rename(&self, src: &Obj, new_name: &str) -> Result<()> {
        self.api.rename_file(&src.id, new_name).await
    }

    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> Result<()> {
        self.api.copy_file(&src.id, &dst_dir.id).await
    }

    async fn remove(&self, obj: &Obj) -> Result<()> {
        self.api.delete_file(&obj.id).await
    }

    async fn put(
        &self,
        ctx: &TaskContext,
        dst_dir: &Obj,
        stream: &mut dyn FileStream,
        progress: UpdateProgress,
    ) -> Result<()> {
        // 阶段 1 失败不保留缓存：内容尚未完整落盘
        let (md5, sha1) = self.resolve_hashes(ctx, stream).await?;

        let result = self
            .upload_resolved(ctx, dst_dir, stream, &md5, &sha1, progress)
            .await;

        if result.is_err() {
            if let Some(cache) = ctx.upload_cache() {
                mark_cache_keep(&cache);
            }
        }
        result
    }

    async fn get_details(&self) -> Result<StorageDetails> {
        let (used, total) = self.api.member_info().await?;
        Ok(StorageDetails {
            disk_usage: DiskUsage::from_used_and_total(used, total),
        })
    }
}

/// 失败后标记缓存文件保留：优先临时文件，其次稳定缓存路径
fn mark_cache_keep(cache: &UploadCache) {
    if let Some(tmp) = cache.temp_file() {
        cache.mark_keep(&tmp);
    } else if let Some(cached) = cache.cached_path() {
        cache.mark_keep(&cached);
    }
}

#[cfg(test)]
pub mod tests_support {
    //! 其他模块测试共用的脚本化远端

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::driver::Obj;
    use crate::drivers::polar::client::{PartBody, PolarApi, UploadPre};

    /// 极简脚本化远端：固定分片大小，可注入某一分片失败
    pub struct StubApi {
        part_size: u64,
        fail_at_part: Option<usize>,
        hash_hit: bool,
        parts: AtomicUsize,
    }

    impl StubApi {
        pub fn new(part_size: u64) -> Self {
            Self {
                part_size,
                fail_at_part: None,
                hash_hit: false,
                parts: AtomicUsize::new(0),
            }
        }

        pub fn failing_at_part(part_size: u64, part: usize) -> Self {
            Self {
                fail_at_part: Some(part),
                ..Self::new(part_size)
            }
        }

        pub fn part_count(&self) -> usize {
            self.parts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolarApi for StubApi {
        async fn up_pre(&self, _dst_dir: &Obj, _name: &str, _size: u64) -> Result<UploadPre> {
            Ok(UploadPre {
                task_id: "stub".to_string(),
                part_size: self.part_size,
            })
        }

        async fn up_hash(&self, _task_id: &str, _md5: &str, _sha1: &str) -> Result<bool> {
            Ok(self.hash_hit)
        }

        async fn up_part(
            &self,
            _task_id: &str,
            _mimetype: &str,
            part_number: usize,
            body: PartBody,
        ) -> Result<String> {
            if self.fail_at_part == Some(part_number) {
                anyhow::bail!("分片 {} 网络超时", part_number);
            }
            let data = body.read_all().await?;
            self.parts.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{:x}", md5::compute(&data)))
        }

        async fn up_commit(&self, _task_id: &str, _md5s: &[String]) -> Result<()> {
            Ok(())
        }

        async fn up_finish(&self, _task_id: &str) -> Result<()> {
            Ok(())
        }

        async fn list_files(&self, _dir_id: &str) -> Result<Vec<Obj>> {
            Ok(Vec::new())
        }

        async fn download_link(&self, file_id: &str) -> Result<String> {
            // 测试里把对象 ID 直接当本地路径用
            Ok(format!("file://{}", file_id))
        }

        async fn make_dir(&self, _parent_id: &str, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn move_file(&self, _file_id: &str, _dst_dir_id: &str) -> Result<()> {
            Ok(())
        }

        async fn rename_file(&self, _file_id: &str, _new_name: &str) -> Result<()> {
            Ok(())
        }

        async fn copy_file(&self, _file_id: &str, _dst_dir_id: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_file(&self, _file_id: &str) -> Result<()> {
            Ok(())
        }

        async fn member_info(&self) -> Result<(u64, u64)> {
            Ok((0, 0))
        }
    }
}
