// 上传流契约
//
// put 消费的流：已知大小、MIME、可选的预计算哈希，
// 以及“落盘缓存并同时写入 tee”的原语（补算哈希时用）。

use std::collections::HashMap;
use std::io::{self, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};

/// 哈希算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Md5,
    Sha1,
}

impl HashAlg {
    /// 十六进制摘要长度
    pub fn width(&self) -> usize {
        match self {
            HashAlg::Md5 => 32,
            HashAlg::Sha1 => 40,
        }
    }
}

/// put 消费的流契约
#[async_trait]
pub trait FileStream: AsyncRead + Send + Unpin {
    /// 目标文件名
    fn name(&self) -> String;

    /// 总字节数
    fn size(&self) -> u64;

    /// MIME 类型
    fn mimetype(&self) -> String;

    /// 预计算哈希（可能缺失，由驱动补算）
    fn get_hash(&self, alg: HashAlg) -> Option<String>;

    /// 把整个流写入缓存并同时灌给 tee
    ///
    /// 返回时全部内容已落盘，后续读取从头开始。
    async fn cache_full_and_tee(&mut self, tee: &mut (dyn Write + Send)) -> Result<PathBuf>;
}

/// 本地文件支撑的上传流
pub struct LocalFileStream {
    file: File,
    path: PathBuf,
    size: u64,
    mimetype: String,
    hashes: HashMap<HashAlg, String>,
}

impl LocalFileStream {
    /// 打开本地文件作为上传流
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("打开上传源文件失败: {:?}", path))?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            mimetype: guess_mimetype(path),
            hashes: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 预置哈希值（例如客户端上传时随请求携带）
    pub fn set_hash(&mut self, alg: HashAlg, value: impl Into<String>) {
        self.hashes.insert(alg, value.into());
    }
}

/// 按扩展名猜 MIME，猜不出来按二进制流
fn guess_mimetype(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

impl AsyncRead for LocalFileStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[async_trait]
impl FileStream for LocalFileStream {
    fn name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mimetype(&self) -> String {
        self.mimetype.clone()
    }

    fn get_hash(&self, alg: HashAlg) -> Option<String> {
        self.hashes.get(&alg).cloned()
    }

    async fn cache_full_and_tee(&mut self, tee: &mut (dyn Write + Send)) -> Result<PathBuf> {
        // 文件本身就是缓存：从头整读一遍灌给 tee，再回绕到文件头
        self.file.seek(SeekFrom::Start(0)).await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tee.write_all(&buf[..n])?;
        }
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(self.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cache_full_and_tee_then_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"hello stream").unwrap();

        let mut stream = LocalFileStream::open(&path).await.unwrap();
        assert_eq!(stream.size(), 12);
        assert_eq!(stream.mimetype(), "text/plain");

        let mut tee: Vec<u8> = Vec::new();
        let cached = stream.cache_full_and_tee(&mut tee).await.unwrap();
        assert_eq!(cached, path);
        assert_eq!(tee, b"hello stream");

        // tee 之后从头可读
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello stream");
    }

    #[tokio::test]
    async fn test_preset_hash_lookup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"x").unwrap();

        let mut stream = LocalFileStream::open(&path).await.unwrap();
        assert!(stream.get_hash(HashAlg::Md5).is_none());
        stream.set_hash(HashAlg::Md5, "d".repeat(32));
        assert_eq!(stream.get_hash(HashAlg::Md5).unwrap().len(), HashAlg::Md5.width());
    }
}
