// Polar 后端 API 客户端
//
// 远端接口抽成 trait，驱动的上传状态机只依赖该接口，
// 测试时用脚本化实现替换真实 HTTP 客户端。

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::driver::Obj;

/// 分片上传完成的哨兵值
pub const PART_FINISH_SENTINEL: &str = "finish";

/// 预创建返回的上传任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPre {
    /// 后端上传任务 ID
    pub task_id: String,
    /// 分片大小（字节）
    pub part_size: u64,
}

/// 分片请求体
///
/// 持有限速读取端；发给 HTTP 客户端时转为流式 body，
/// 测试里可以整体读出校验内容。
pub struct PartBody {
    reader: Box<dyn AsyncRead + Send + Unpin + 'static>,
    len: u64,
}

impl PartBody {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_body(self) -> reqwest::Body {
        reqwest::Body::wrap_stream(ReaderStream::new(self.reader))
    }

    /// 读出全部内容（测试与重放用）
    pub async fn read_all(mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Polar 远端接口
#[async_trait]
pub trait PolarApi: Send + Sync {
    /// 预创建上传任务
    async fn up_pre(&self, dst_dir: &Obj, name: &str, size: u64) -> Result<UploadPre>;

    /// 秒传检查；true 表示服务端已有同内容文件，上传直接完成
    async fn up_hash(&self, task_id: &str, md5: &str, sha1: &str) -> Result<bool>;

    /// 上传一个分片，返回分片 MD5；返回 `finish` 哨兵表示整个上传已完成
    async fn up_part(
        &self,
        task_id: &str,
        mimetype: &str,
        part_number: usize,
        body: PartBody,
    ) -> Result<String>;

    /// 提交分片 MD5 列表
    async fn up_commit(&self, task_id: &str, md5s: &[String]) -> Result<()>;

    /// 收尾
    async fn up_finish(&self, task_id: &str) -> Result<()>;

    async fn list_files(&self, dir_id: &str) -> Result<Vec<Obj>>;

    async fn download_link(&self, file_id: &str) -> Result<String>;

    async fn make_dir(&self, parent_id: &str, name: &str) -> Result<()>;

    async fn move_file(&self, file_id: &str, dst_dir_id: &str) -> Result<()>;

    async fn rename_file(&self, file_id: &str, new_name: &str) -> Result<()>;

    async fn copy_file(&self, file_id: &str, dst_dir_id: &str) -> Result<()>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;

    /// 已用容量与总容量
    async fn member_info(&self) -> Result<(u64, u64)>;
}

/// 统一响应信封
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

/// HTTP 实现
pub struct PolarClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PolarClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("构建 HTTP 客户端失败")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.with_context(|| format!("请求失败: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("请求 {} 返回 {}", url, status));
        }
        let envelope: Envelope<T> = resp.json().await.context("解析响应失败")?;
        if envelope.code != 0 {
            return Err(anyhow!("接口错误 {}: {}", envelope.code, envelope.message));
        }
        envelope.data.ok_or_else(|| anyhow!("响应缺少 data 字段"))
    }

    /// 只关心成败、不取 data 的请求
    async fn request_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.with_context(|| format!("请求失败: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("请求 {} 返回 {}", url, status));
        }
        let envelope: Envelope<serde_json::Value> =
            resp.json().await.context("解析响应失败")?;
        if envelope.code != 0 {
            return Err(anyhow!("接口错误 {}: {}", envelope.code, envelope.message));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PartData {
    md5: String,
}

#[derive(Debug, Deserialize)]
struct HashData {
    finish: bool,
}

#[derive(Debug, Deserialize)]
struct LinkData {
    url: String,
}

#[derive(Debug, Deserialize)]
struct MemberData {
    use_capacity: u64,
    total_capacity: u64,
}

#[async_trait]
impl PolarApi for PolarClient {
    async fn up_pre(&self, dst_dir: &Obj, name: &str, size: u64) -> Result<UploadPre> {
        self.request(
            Method::POST,
            "/file/upload/pre",
            Some(serde_json::json!({
                "pdir_fid": dst_dir.id,
                "file_name": name,
                "size": size,
            })),
        )
        .await
    }

    async fn up_hash(&self, task_id: &str, md5: &str, sha1: &str) -> Result<bool> {
        let data: HashData = self
            .request(
                Method::POST,
                "/file/upload/hash",
                Some(serde_json::json!({
                    "task_id": task_id,
                    "content_md5": md5,
                    "content_sha1": sha1,
                })),
            )
            .await?;
        Ok(data.finish)
    }

    async fn up_part(
        &self,
        task_id: &str,
        mimetype: &str,
        part_number: usize,
        body: PartBody,
    ) -> Result<String> {
        let url = format!(
            "{}/file/upload/part?task_id={}&part_number={}",
            self.base_url, task_id, part_number
        );
        let len = body.len();
        let resp = self
            .http
            .put(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", mimetype.to_string())
            .header("Content-Length", len)
            .body(body.into_body())
            .send()
            .await
            .with_context(|| format!("上传分片 {} 失败", part_number))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("分片 {} 返回 {}", part_number, status));
        }
        let envelope: Envelope<PartData> = resp.json().await.context("解析分片响应失败")?;
        if envelope.code != 0 {
            return Err(anyhow!("分片接口错误 {}: {}", envelope.code, envelope.message));
        }
        let md5 = envelope
            .data
            .ok_or_else(|| anyhow!("分片响应缺少 data 字段"))?
            .md5;
        debug!("分片 {} 上传完成: {} 字节", part_number, len);
        Ok(md5)
    }

    async fn up_commit(&self, task_id: &str, md5s: &[String]) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/upload/commit",
            Some(serde_json::json!({
                "task_id": task_id,
                "md5s": md5s,
            })),
        )
        .await
    }

    async fn up_finish(&self, task_id: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/upload/finish",
            Some(serde_json::json!({ "task_id": task_id })),
        )
        .await
    }

    async fn list_files(&self, dir_id: &str) -> Result<Vec<Obj>> {
        self.request(
            Method::GET,
            &format!("/file/list?pdir_fid={}", dir_id),
            None,
        )
        .await
    }

    async fn download_link(&self, file_id: &str) -> Result<String> {
        let data: LinkData = self
            .request(
                Method::POST,
                "/file/download",
                Some(serde_json::json!({ "fid": file_id })),
            )
            .await?;
        Ok(data.url)
    }

    async fn make_dir(&self, parent_id: &str, name: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/mkdir",
            Some(serde_json::json!({
                "pdir_fid": parent_id,
                "file_name": name,
            })),
        )
        .await
    }

    async fn move_file(&self, file_id: &str, dst_dir_id: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/move",
            Some(serde_json::json!({
                "filelist": [file_id],
                "to_pdir_fid": dst_dir_id,
            })),
        )
        .await
    }

    async fn rename_file(&self, file_id: &str, new_name: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/rename",
            Some(serde_json::json!({
                "fid": file_id,
                "file_name": new_name,
            })),
        )
        .await
    }

    async fn copy_file(&self, file_id: &str, dst_dir_id: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/copy",
            Some(serde_json::json!({
                "filelist": [file_id],
                "to_pdir_fid": dst_dir_id,
            })),
        )
        .await
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/file/delete",
            Some(serde_json::json!({ "filelist": [file_id] })),
        )
        .await
    }

    async fn member_info(&self) -> Result<(u64, u64)> {
        let data: MemberData = self.request(Method::GET, "/member/info", None).await?;
        Ok((data.use_capacity, data.total_capacity))
    }
}
