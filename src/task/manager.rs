// 任务管理器
//
// 每种任务类型一个管理器，负责：
// - 有界工作池（FIFO 待执行队列，最多 workers 个执行器并行）
// - 运行时调整执行器数量（缩容时在任务边界退出）
// - 指数退避重试与取消
// - 状态变更时回写持久化快照
//
// 构造时通过持久化读取钩子恢复上一次进程的任务，
// 快照中处于运行态的任务视为进程崩溃中断，统一回到待调度。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::base::PersistableTask;
use super::state::TaskState;

/// 持久化读取钩子：返回该类型全部任务的 JSON 数组
pub type PersistReader =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;

/// 持久化写入钩子：入参为该类型全部任务的 JSON 数组，要求幂等
pub type PersistWriter =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 恢复钩子：快照恢复出的任务在入册前经过此回调
/// （用于重新挂接序列化之外的运行时依赖）
pub type RestoreHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// 管理器构造参数
///
/// 读取与写入钩子相互独立：快照持久化关闭的类型没有读取钩子，
/// 但仍可挂写入钩子以刷新索引表。
pub struct ManagerConfig<T> {
    /// 执行器数量
    pub workers: usize,
    /// 最大自动重试次数
    pub max_retry: u32,
    /// 持久化读取钩子
    pub persist_reader: Option<PersistReader>,
    /// 持久化写入钩子
    pub persist_writer: Option<PersistWriter>,
    /// 恢复钩子
    pub on_restore: Option<RestoreHook<T>>,
}

impl<T> Default for ManagerConfig<T> {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retry: 3,
            persist_reader: None,
            persist_writer: None,
            on_restore: None,
        }
    }
}

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 队列空闲时执行器的轮询间隔
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 计算指数退避延迟
///
/// 延迟序列：100ms、200ms、400ms、800ms...，上限 5s
fn backoff_delay(retry_count: u32) -> Duration {
    let delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// 按类型的任务管理器
pub struct TaskManager<T: PersistableTask> {
    /// 任务类型标识（copy/move/upload/...）
    kind: String,
    /// 任务注册表（task_id -> 任务）
    tasks: DashMap<String, Arc<T>>,
    /// 待执行队列（task_id 列表，FIFO）
    queue: Mutex<VecDeque<String>>,
    /// 入队通知
    notify: Notify,
    /// 目标执行器数量
    workers_target: AtomicUsize,
    /// 存活执行器数量
    workers_alive: AtomicUsize,
    /// 最大自动重试次数
    max_retry: u32,
    /// 持久化写入钩子
    writer: Option<PersistWriter>,
    /// 自引用，扩容时据此派生新的执行器
    me: Weak<Self>,
}

impl<T: PersistableTask> TaskManager<T> {
    /// 创建管理器并恢复持久化任务
    pub async fn new(kind: impl Into<String>, config: ManagerConfig<T>) -> Arc<Self> {
        let (reader, writer) = (config.persist_reader, config.persist_writer);

        let kind = kind.into();
        let manager = Arc::new_cyclic(|me| Self {
            kind,
            tasks: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            workers_target: AtomicUsize::new(0),
            workers_alive: AtomicUsize::new(0),
            max_retry: config.max_retry,
            writer,
            me: me.clone(),
        });

        if let Some(reader) = reader {
            match reader().await {
                Ok(bytes) => manager.rehydrate(&bytes, config.on_restore.as_ref()).await,
                Err(e) => warn!("读取 {} 任务快照失败: {:#}", manager.kind, e),
            }
        }

        manager.set_workers_num_active(config.workers);
        manager
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// 从快照字节恢复任务
    async fn rehydrate(&self, bytes: &[u8], on_restore: Option<&RestoreHook<T>>) {
        let tasks: Vec<T> = match serde_json::from_slice(bytes) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("解析 {} 任务快照失败: {}", self.kind, e);
                return;
            }
        };

        let mut restored = 0;
        let mut queue = self.queue.lock().await;
        for task in tasks {
            if let Some(hook) = on_restore {
                hook(&task);
            }
            let base = task.base();
            if base.id().is_empty() {
                base.set_id(Uuid::new_v4().to_string());
            }
            // 快照里的运行态说明进程在执行中崩溃，回到待调度重跑
            if !base.state().is_terminal() {
                base.set_state(TaskState::Pending);
                queue.push_back(base.id());
            }
            restored += 1;
            self.tasks.insert(base.id(), Arc::new(task));
        }
        drop(queue);

        if restored > 0 {
            info!("恢复 {} 任务 {} 个", self.kind, restored);
        }
    }

    /// 提交任务，立即返回任务 ID
    pub async fn submit(&self, task: T) -> String {
        let task = Arc::new(task);
        let base = task.base();
        if base.id().is_empty() {
            base.set_id(Uuid::new_v4().to_string());
        }
        base.set_state(TaskState::Pending);
        let id = base.id();

        self.tasks.insert(id.clone(), task);
        self.queue.lock().await.push_back(id.clone());
        self.notify.notify_one();
        self.persist().await;

        debug!("提交 {} 任务: {}", self.kind, id);
        id
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<T>> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_all(&self) -> Vec<Arc<T>> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get_by_condition(&self, pred: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        self.tasks
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 取消任务（幂等）
    ///
    /// 运行中的任务进入 Canceling 并发出取消信号，由执行器在下一个
    /// 安全点确认为 Canceled；尚未运行的任务直接落为 Canceled。
    pub async fn cancel(&self, id: &str) {
        let Some(task) = self.get_by_id(id) else {
            return;
        };
        let base = task.base();
        match base.state() {
            s if s.is_terminal() => return,
            TaskState::Running | TaskState::Canceling => {
                base.set_state(TaskState::Canceling);
                base.cancel();
            }
            _ => {
                base.cancel();
                base.set_end_time(Some(Utc::now()));
                base.set_state(TaskState::Canceled);
                self.queue.lock().await.retain(|qid| qid != id);
            }
        }
        self.persist().await;
    }

    /// 删除任务（运行中的先取消）
    pub async fn remove(&self, id: &str) {
        if let Some(task) = self.get_by_id(id) {
            task.base().cancel();
        }
        self.tasks.remove(id);
        self.queue.lock().await.retain(|qid| qid != id);
        self.persist().await;
    }

    /// 按条件删除，返回删除数量
    pub async fn remove_by_condition(&self, pred: impl Fn(&T) -> bool) -> usize {
        let ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &ids {
            if let Some(task) = self.get_by_id(id) {
                task.base().cancel();
            }
            self.tasks.remove(id);
        }
        if !ids.is_empty() {
            self.queue.lock().await.retain(|qid| !ids.contains(qid));
            self.persist().await;
        }
        ids.len()
    }

    /// 用户重试：终态任务重置后回到队尾，非终态为空操作
    pub async fn retry(&self, id: &str) {
        let Some(task) = self.get_by_id(id) else {
            return;
        };
        let base = task.base();
        if !base.state().is_terminal() {
            return;
        }

        base.renew_cancel_token();
        base.clear_err();
        base.set_status("");
        base.set_progress(0.0);
        base.set_start_time(None);
        base.set_end_time(None);
        base.reset_retry_count();
        base.set_state(TaskState::Pending);

        self.queue.lock().await.push_back(id.to_string());
        self.notify.notify_one();
        self.persist().await;
        debug!("重试 {} 任务: {}", self.kind, id);
    }

    /// 运行时调整执行器数量
    ///
    /// 缩容：多出的执行器完成当前任务后退出；
    /// 扩容：立刻补足新的执行器开始消费队列。
    pub fn set_workers_num_active(&self, n: usize) {
        self.workers_target.store(n, Ordering::SeqCst);
        self.notify.notify_waiters();

        loop {
            let alive = self.workers_alive.load(Ordering::SeqCst);
            if alive >= n {
                break;
            }
            if self
                .workers_alive
                .compare_exchange(alive, alive + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let Some(manager) = self.me.upgrade() else {
                    return;
                };
                tokio::spawn(async move { manager.worker_loop().await });
            }
        }
    }

    /// 当前存活执行器数量
    pub fn workers_num_active(&self) -> usize {
        self.workers_alive.load(Ordering::SeqCst)
    }

    /// 执行器主循环
    async fn worker_loop(self: Arc<Self>) {
        loop {
            // 缩容检查：超出目标的执行器在任务边界退出
            let target = self.workers_target.load(Ordering::SeqCst);
            let alive = self.workers_alive.load(Ordering::SeqCst);
            if alive > target {
                if self
                    .workers_alive
                    .compare_exchange(alive, alive - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    debug!("{} 执行器退出（目标 {}）", self.kind, target);
                    return;
                }
                continue;
            }

            let next = self.queue.lock().await.pop_front();
            match next {
                Some(id) => self.execute(&id).await,
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }

    /// 执行单个任务
    async fn execute(&self, id: &str) {
        let Some(task) = self.get_by_id(id) else {
            return;
        };
        let base = task.base();

        // 入队后被取消
        if base.is_canceled() {
            if base.state() != TaskState::Canceled {
                base.set_end_time(Some(Utc::now()));
                base.set_state(TaskState::Canceled);
                self.persist().await;
            }
            return;
        }
        // 入队后被删除重建或重复入队
        if base.state() != TaskState::Pending {
            return;
        }

        base.set_state(TaskState::Running);
        if base.start_time().is_none() {
            base.set_start_time(Some(Utc::now()));
        }
        base.set_end_time(None);
        self.persist().await;
        info!("开始执行 {} 任务: {}", self.kind, id);

        let token = base.cancel_token();
        let result = tokio::select! {
            r = task.run() => r,
            _ = token.cancelled() => Err(anyhow!("任务已取消")),
        };

        match result {
            Ok(()) => {
                base.set_progress(100.0);
                base.set_end_time(Some(Utc::now()));
                base.set_state(TaskState::Succeeded);
                info!("{} 任务完成: {}", self.kind, id);
            }
            Err(err) if token.is_cancelled() => {
                base.set_end_time(Some(Utc::now()));
                base.set_state(TaskState::Canceled);
                info!("{} 任务已取消: {} ({})", self.kind, id, err);
            }
            Err(err) => {
                base.set_err(err.to_string());
                base.set_state(TaskState::Errored);
                let retried = base.retry_count();
                if retried < self.max_retry {
                    base.set_state(TaskState::WaitingRetry);
                    self.persist().await;
                    warn!(
                        "{} 任务出错，等待第 {}/{} 次重试: {} ({})",
                        self.kind,
                        retried + 1,
                        self.max_retry,
                        id,
                        err
                    );
                    // 退避期间仍需响应取消
                    tokio::select! {
                        _ = tokio::time::sleep(backoff_delay(retried)) => {
                            base.inc_retry_count();
                            base.set_state(TaskState::BeforeRetry);
                            base.set_state(TaskState::Pending);
                            self.queue.lock().await.push_back(id.to_string());
                            self.notify.notify_one();
                        }
                        _ = token.cancelled() => {
                            base.set_end_time(Some(Utc::now()));
                            base.set_state(TaskState::Canceled);
                        }
                    }
                } else {
                    base.set_state(TaskState::Failing);
                    warn!("{} 任务失败: {} ({})", self.kind, id, err);
                    base.set_end_time(Some(Utc::now()));
                    base.set_state(TaskState::Failed);
                }
            }
        }
        self.persist().await;
    }

    /// 将当前任务集合序列化为 JSON 数组并写入持久化钩子
    ///
    /// 写入失败只记录日志，下一次成功写入会收敛状态。
    async fn persist(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let tasks = self.get_all();
        let refs: Vec<&T> = tasks.iter().map(|t| t.as_ref()).collect();
        let snapshot = match serde_json::to_vec(&refs) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("序列化 {} 任务快照失败: {}", self.kind, e);
                return;
            }
        };
        if let Err(e) = writer(snapshot).await {
            warn!("保存 {} 任务快照失败: {:#}", self.kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::base::{Task, TaskBase};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;

    /// 可编排行为的测试任务
    #[derive(Serialize, Deserialize)]
    struct ProbeTask {
        #[serde(flatten)]
        base: TaskBase,
        label: String,
        /// 前 N 次执行失败
        #[serde(default)]
        fail_times: u32,
        #[serde(skip)]
        runs: AtomicU32,
        /// 执行耗时（毫秒）
        #[serde(default)]
        run_ms: u64,
    }

    impl ProbeTask {
        fn new(label: &str) -> Self {
            Self {
                base: TaskBase::new(),
                label: label.to_string(),
                fail_times: 0,
                runs: AtomicU32::new(0),
                run_ms: 0,
            }
        }

        fn failing(label: &str, fail_times: u32) -> Self {
            let mut task = Self::new(label);
            task.fail_times = fail_times;
            task
        }

        fn slow(label: &str, run_ms: u64) -> Self {
            let mut task = Self::new(label);
            task.run_ms = run_ms;
            task
        }
    }

    #[async_trait::async_trait]
    impl Task for ProbeTask {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn name(&self) -> String {
            self.label.clone()
        }

        async fn run(&self) -> anyhow::Result<()> {
            let attempt = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.run_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.run_ms)).await;
            }
            if attempt < self.fail_times {
                anyhow::bail!("预设失败 {}", attempt + 1);
            }
            Ok(())
        }
    }

    /// 轮询等待条件成立
    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("等待条件超时");
    }

    fn capture_writer() -> (PersistWriter, Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
        let snapshots: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let captured = snapshots.clone();
        let writer: PersistWriter = Arc::new(move |bytes: Vec<u8>| {
            let captured = captured.clone();
            Box::pin(async move {
                captured.lock().unwrap().push(bytes);
                Ok(())
            }) as BoxFuture<'static, anyhow::Result<()>>
        });
        (writer, snapshots)
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let manager: Arc<TaskManager<ProbeTask>> =
            TaskManager::new("copy", ManagerConfig::default()).await;
        let id = manager.submit(ProbeTask::new("a")).await;

        wait_for(|| {
            manager
                .get_by_id(&id)
                .map(|t| t.base().state() == TaskState::Succeeded)
                .unwrap_or(false)
        })
        .await;

        let task = manager.get_by_id(&id).unwrap();
        assert_eq!(task.base().progress(), 100.0);
        assert!(task.base().start_time().is_some());
        assert!(task.base().end_time() >= task.base().start_time());
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 1,
                max_retry: 3,
                persist_reader: None,
                persist_writer: None,
                on_restore: None,
            },
        )
        .await;
        let id = manager.submit(ProbeTask::failing("b", 2)).await;

        wait_for(|| {
            manager
                .get_by_id(&id)
                .map(|t| t.base().state() == TaskState::Succeeded)
                .unwrap_or(false)
        })
        .await;

        let task = manager.get_by_id(&id).unwrap();
        assert_eq!(task.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 1,
                max_retry: 1,
                persist_reader: None,
                persist_writer: None,
                on_restore: None,
            },
        )
        .await;
        let id = manager.submit(ProbeTask::failing("c", 10)).await;

        wait_for(|| {
            manager
                .get_by_id(&id)
                .map(|t| t.base().state() == TaskState::Failed)
                .unwrap_or(false)
        })
        .await;

        let task = manager.get_by_id(&id).unwrap();
        assert!(task.base().err().is_some());
        // 首次执行 + 1 次重试
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let manager: Arc<TaskManager<ProbeTask>> =
            TaskManager::new("copy", ManagerConfig::default()).await;
        let id = manager.submit(ProbeTask::slow("d", 10_000)).await;

        wait_for(|| {
            manager
                .get_by_id(&id)
                .map(|t| t.base().state() == TaskState::Running)
                .unwrap_or(false)
        })
        .await;

        manager.cancel(&id).await;
        wait_for(|| {
            manager
                .get_by_id(&id)
                .map(|t| t.base().state() == TaskState::Canceled)
                .unwrap_or(false)
        })
        .await;

        // 幂等：再次取消不改变结果
        manager.cancel(&id).await;
        assert_eq!(
            manager.get_by_id(&id).unwrap().base().state(),
            TaskState::Canceled
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: None,
                persist_writer: None,
                on_restore: None,
            },
        )
        .await;
        let id = manager.submit(ProbeTask::new("e")).await;
        manager.cancel(&id).await;
        assert_eq!(
            manager.get_by_id(&id).unwrap().base().state(),
            TaskState::Canceled
        );
    }

    #[tokio::test]
    async fn test_user_retry_only_on_terminal() {
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: None,
                persist_writer: None,
                on_restore: None,
            },
        )
        .await;
        let id = manager.submit(ProbeTask::new("f")).await;

        // Pending 非终态，重试是空操作
        manager.retry(&id).await;
        assert_eq!(
            manager.get_by_id(&id).unwrap().base().state(),
            TaskState::Pending
        );

        manager.cancel(&id).await;
        manager.retry(&id).await;
        let task = manager.get_by_id(&id).unwrap();
        assert_eq!(task.base().state(), TaskState::Pending);
        assert!(!task.base().is_canceled());
        assert_eq!(task.base().progress(), 0.0);
    }

    #[tokio::test]
    async fn test_worker_resize() {
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: None,
                persist_writer: None,
                on_restore: None,
            },
        )
        .await;
        let id = manager.submit(ProbeTask::new("g")).await;

        // 没有执行器时任务保持 Pending
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            manager.get_by_id(&id).unwrap().base().state(),
            TaskState::Pending
        );

        manager.set_workers_num_active(2);
        wait_for(|| {
            manager
                .get_by_id(&id)
                .map(|t| t.base().state() == TaskState::Succeeded)
                .unwrap_or(false)
        })
        .await;

        manager.set_workers_num_active(0);
        wait_for(|| manager.workers_num_active() == 0).await;
    }

    #[tokio::test]
    async fn test_persist_and_rehydrate() {
        let (writer, snapshots) = capture_writer();
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: Some(Arc::new(|| {
                    Box::pin(async { Ok(b"[]".to_vec()) })
                        as BoxFuture<'static, anyhow::Result<Vec<u8>>>
                })),
                persist_writer: Some(writer),
                on_restore: None,
            },
        )
        .await;

        let id = manager.submit(ProbeTask::new("h")).await;
        let last = snapshots.lock().unwrap().last().unwrap().clone();

        // 模拟进程重启：用上一次快照构造新管理器
        let (writer2, _) = capture_writer();
        let restored: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 1,
                max_retry: 0,
                persist_reader: Some(Arc::new(move || {
                    let last = last.clone();
                    Box::pin(async move { Ok(last) })
                        as BoxFuture<'static, anyhow::Result<Vec<u8>>>
                })),
                persist_writer: Some(writer2),
                on_restore: None,
            },
        )
        .await;

        let task = restored.get_by_id(&id).expect("任务应被恢复");
        assert_eq!(task.name(), "h");
        wait_for(|| task.base().state() == TaskState::Succeeded).await;
    }

    #[tokio::test]
    async fn test_rehydrate_running_becomes_pending() {
        // 快照里写死一个 Running 状态的任务
        let snapshot = serde_json::json!([{
            "id": "r1", "state": 1, "status": "", "progress": 30.0,
            "total_bytes": 0, "label": "crashed",
        }])
        .to_string()
        .into_bytes();

        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: Some(Arc::new(move || {
                    let snapshot = snapshot.clone();
                    Box::pin(async move { Ok(snapshot) })
                        as BoxFuture<'static, anyhow::Result<Vec<u8>>>
                })),
                persist_writer: Some(Arc::new(|_| {
                    Box::pin(async { Ok(()) }) as BoxFuture<'static, anyhow::Result<()>>
                })),
                on_restore: None,
            },
        )
        .await;

        assert_eq!(
            manager.get_by_id("r1").unwrap().base().state(),
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn test_remove_by_condition() {
        let manager: Arc<TaskManager<ProbeTask>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: None,
                persist_writer: None,
                on_restore: None,
            },
        )
        .await;
        manager.submit(ProbeTask::new("keep")).await;
        let drop_id = manager.submit(ProbeTask::new("drop")).await;

        let removed = manager.remove_by_condition(|t| t.label == "drop").await;
        assert_eq!(removed, 1);
        assert!(manager.get_by_id(&drop_id).is_none());
        assert_eq!(manager.get_all().len(), 1);
    }

    #[test]
    fn test_backoff_delay_sequence() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(10), Duration::from_millis(5000));
    }
}
