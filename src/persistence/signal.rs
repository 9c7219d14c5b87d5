// 存储加载信号
//
// 一次性屏障：快照读取必须等到存储初始化完成后才能返回，
// 否则恢复出来的任务会在存储挂载前开始执行。

use std::sync::Arc;

use tokio::sync::watch;

/// 一次性加载屏障
#[derive(Clone)]
pub struct LoadSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl LoadSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// 触发信号，唤醒所有等待者；重复触发无副作用
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    /// 阻塞直到信号触发；已触发时立即返回
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|fired| *fired).await;
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Default for LoadSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_blocks_until_fired() {
        let signal = LoadSignal::new();
        assert!(!signal.is_fired());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        // 未触发前等待者不应返回
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("触发后应立即返回")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_fire_returns_immediately() {
        let signal = LoadSignal::new();
        signal.fire();
        signal.fire();
        signal.wait().await;
        assert!(signal.is_fired());
    }
}
