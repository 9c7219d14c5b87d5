// 任务核心字段
//
// 每个具体任务通过嵌入 TaskBase 获得统一的身份、状态、进度与取消能力。
// 字段全部使用内部可变性，执行器与 HTTP 处理器可以在不加外层锁的情况下读取。

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use super::state::{Creator, TaskState};

/// 任务核心字段集合
///
/// 序列化为扁平快照（`id`/`state`/`progress`/...），反序列化时
/// 取消令牌与重试计数重新初始化。
pub struct TaskBase {
    id: RwLock<String>,
    creator: RwLock<Option<Creator>>,
    state: RwLock<TaskState>,
    status: RwLock<String>,
    /// f64 的位表示，NaN 原样保存，由视图层折算为 100
    progress: AtomicU64,
    start_time: RwLock<Option<DateTime<Utc>>>,
    end_time: RwLock<Option<DateTime<Utc>>>,
    total_bytes: AtomicI64,
    err: RwLock<Option<String>>,
    retry_count: AtomicU32,
    cancel: RwLock<CancellationToken>,
}

impl Default for TaskBase {
    fn default() -> Self {
        Self {
            id: RwLock::new(String::new()),
            creator: RwLock::new(None),
            state: RwLock::new(TaskState::Pending),
            status: RwLock::new(String::new()),
            progress: AtomicU64::new(0f64.to_bits()),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
            total_bytes: AtomicI64::new(0),
            err: RwLock::new(None),
            retry_count: AtomicU32::new(0),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }
}

impl TaskBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_creator(creator: Creator) -> Self {
        let base = Self::default();
        *base.creator.write().unwrap() = Some(creator);
        base
    }

    pub fn id(&self) -> String {
        self.id.read().unwrap().clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write().unwrap() = id.into();
    }

    pub fn creator(&self) -> Option<Creator> {
        self.creator.read().unwrap().clone()
    }

    pub fn set_creator(&self, creator: Option<Creator>) {
        *self.creator.write().unwrap() = creator;
    }

    pub fn state(&self) -> TaskState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.write().unwrap() = state;
    }

    pub fn status(&self) -> String {
        self.status.read().unwrap().clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.write().unwrap() = status.into();
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::SeqCst))
    }

    pub fn set_progress(&self, progress: f64) {
        self.progress.store(progress.to_bits(), Ordering::SeqCst);
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.read().unwrap()
    }

    pub fn set_start_time(&self, t: Option<DateTime<Utc>>) {
        *self.start_time.write().unwrap() = t;
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.read().unwrap()
    }

    pub fn set_end_time(&self, t: Option<DateTime<Utc>>) {
        *self.end_time.write().unwrap() = t;
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn set_total_bytes(&self, n: i64) {
        self.total_bytes.store(n, Ordering::SeqCst);
    }

    pub fn err(&self) -> Option<String> {
        self.err.read().unwrap().clone()
    }

    pub fn set_err(&self, err: impl Into<String>) {
        *self.err.write().unwrap() = Some(err.into());
    }

    pub fn clear_err(&self) {
        *self.err.write().unwrap() = None;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn inc_retry_count(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_retry_count(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    /// 当前取消令牌的克隆
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().unwrap().clone()
    }

    /// 发出取消信号
    pub fn cancel(&self) {
        self.cancel.read().unwrap().cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.read().unwrap().is_cancelled()
    }

    /// 换发新的取消令牌（用户重试时调用，旧信号不得影响新一轮执行）
    pub fn renew_cancel_token(&self) {
        *self.cancel.write().unwrap() = CancellationToken::new();
    }
}

impl std::fmt::Debug for TaskBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBase")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

/// 快照形态（持久化 JSON 的形状）
#[derive(Serialize, Deserialize)]
struct TaskBaseSnapshot {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creator: Option<Creator>,
    state: TaskState,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    total_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Serialize for TaskBase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // NaN 无法以 JSON 数字表达，按对外口径折算为 100
        let progress = self.progress();
        let progress = if progress.is_nan() { 100.0 } else { progress };
        TaskBaseSnapshot {
            id: self.id(),
            creator: self.creator(),
            state: self.state(),
            status: self.status(),
            progress,
            start_time: self.start_time(),
            end_time: self.end_time(),
            total_bytes: self.total_bytes(),
            error: self.err(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskBase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let snap = TaskBaseSnapshot::deserialize(deserializer)?;
        let base = TaskBase::new();
        base.set_id(snap.id);
        base.set_creator(snap.creator);
        base.set_state(snap.state);
        base.set_status(snap.status);
        base.set_progress(snap.progress);
        base.set_start_time(snap.start_time);
        base.set_end_time(snap.end_time);
        base.set_total_bytes(snap.total_bytes);
        if let Some(err) = snap.error {
            base.set_err(err);
        }
        Ok(base)
    }
}

/// 任务契约
///
/// 具体任务类型实现此 trait，并保证可以通过 serde 在快照中往返。
#[async_trait::async_trait]
pub trait Task: Send + Sync + 'static {
    /// 核心字段访问
    fn base(&self) -> &TaskBase;

    /// 展示名称
    fn name(&self) -> String;

    /// 执行任务主体
    ///
    /// 执行器在每个安全点自行检查 `base().cancel_token()`；
    /// 管理器同时会在令牌触发时中止本次执行。
    async fn run(&self) -> anyhow::Result<()>;
}

/// 管理器对任务类型的完整约束
pub trait PersistableTask: Task + Serialize + DeserializeOwned {}

impl<T> PersistableTask for T where T: Task + Serialize + DeserializeOwned {}
