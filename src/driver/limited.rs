// 限速上传读取器
//
// 包装分片数据的读取端：每次读取前响应取消信号，
// 并按字节/秒的窗口配额限速。

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// 带取消与限速的上传读取器
pub struct LimitedUploadStream<R> {
    inner: R,
    cancel: CancellationToken,
    /// 字节/秒；None 表示不限速
    limit_bps: Option<u64>,
    sleep: Option<Pin<Box<Sleep>>>,
    window_start: Instant,
    window_sent: u64,
}

impl<R> LimitedUploadStream<R> {
    pub fn new(cancel: CancellationToken, inner: R) -> Self {
        Self {
            inner,
            cancel,
            limit_bps: None,
            sleep: None,
            window_start: Instant::now(),
            window_sent: 0,
        }
    }

    pub fn with_limit(mut self, bytes_per_second: Option<u64>) -> Self {
        self.limit_bps = bytes_per_second.filter(|l| *l > 0);
        self
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedUploadStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "上传已取消",
            )));
        }

        // 配额用尽后的窗口等待
        if let Some(sleep) = &mut this.sleep {
            match sleep.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {
                    this.sleep = None;
                    this.window_start = Instant::now();
                    this.window_sent = 0;
                }
            }
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                this.window_sent += n;
                if let Some(limit) = this.limit_bps {
                    if this.window_sent >= limit {
                        let elapsed = this.window_start.elapsed();
                        if elapsed < Duration::from_secs(1) {
                            this.sleep = Some(Box::pin(tokio::time::sleep(
                                Duration::from_secs(1) - elapsed,
                            )));
                        } else {
                            this.window_start = Instant::now();
                            this.window_sent = 0;
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_passes_data_through() {
        let data = vec![7u8; 4096];
        let mut reader =
            LimitedUploadStream::new(CancellationToken::new(), std::io::Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_cancelled_read_errors() {
        let token = CancellationToken::new();
        token.cancel();
        let mut reader =
            LimitedUploadStream::new(token, std::io::Cursor::new(vec![0u8; 16]));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_limit_delays_next_window() {
        // 配额 1KB/s，读 2KB 至少要跨一个窗口
        let data = vec![1u8; 2048];
        let mut reader = LimitedUploadStream::new(
            CancellationToken::new(),
            std::io::Cursor::new(data),
        )
        .with_limit(Some(1024));

        let started = std::time::Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 2048);
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
