// 管理器持久化钩子
//
// 把数据库操作包装成任务管理器需要的读取/写入闭包。
// 写入钩子同时维护两个写目标：快照表与索引表。索引刷新失败只记日志，
// 不影响快照写入；快照持久化关闭的类型仍然刷新索引。

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use crate::task::{PersistableTask, PersistReader, PersistWriter, TaskView};

use super::signal::LoadSignal;
use super::store::TaskDb;

/// 构造快照读取钩子
///
/// 持久化关闭的类型没有读取钩子（管理器以空任务集启动）。
/// 读取在存储加载信号触发前阻塞。
pub fn task_persist_read_fn(
    db: Arc<TaskDb>,
    kind: &'static str,
    enabled: bool,
    signal: LoadSignal,
) -> Option<PersistReader> {
    if !enabled {
        return None;
    }
    Some(Arc::new(move || {
        let db = db.clone();
        let signal = signal.clone();
        Box::pin(async move {
            signal.wait().await;
            let json = tokio::task::spawn_blocking(move || db.snapshot_read(kind)).await??;
            Ok(json.into_bytes())
        }) as BoxFuture<'static, anyhow::Result<Vec<u8>>>
    }))
}

/// 构造组合写入钩子（快照 + 索引）
///
/// 入参是该类型全部任务的 JSON 数组。索引刷新总是执行；
/// 快照写入仅在该类型开启持久化时执行。
pub fn task_persist_write_fn<T: PersistableTask>(
    db: Arc<TaskDb>,
    kind: &'static str,
    enabled: bool,
) -> PersistWriter {
    Arc::new(move |data: Vec<u8>| {
        let db = db.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                // 从快照反序列化出任务，生成索引行
                match serde_json::from_slice::<Vec<T>>(&data) {
                    Ok(tasks) => {
                        let views: Vec<TaskView> =
                            tasks.iter().map(|t| TaskView::of(t)).collect();
                        if let Err(e) = db.upsert_task_records_from_views(kind, &views) {
                            warn!("刷新 {} 任务索引失败: {:#}", kind, e);
                        }
                    }
                    Err(e) => warn!("解析 {} 任务快照失败，跳过索引刷新: {}", kind, e),
                }
                if enabled {
                    db.snapshot_write(kind, &data)?;
                }
                Ok(())
            })
            .await?
        }) as BoxFuture<'static, anyhow::Result<()>>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskBase, TaskState};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct HookProbe {
        #[serde(flatten)]
        base: TaskBase,
        name: String,
    }

    #[async_trait::async_trait]
    impl Task for HookProbe {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        async fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn probe_snapshot(id: &str, name: &str, state: TaskState) -> Vec<u8> {
        let probe = HookProbe {
            base: TaskBase::new(),
            name: name.to_string(),
        };
        probe.base.set_id(id);
        probe.base.set_state(state);
        serde_json::to_vec(&vec![&probe]).unwrap()
    }

    #[tokio::test]
    async fn test_write_fn_updates_snapshot_and_index() {
        let db = Arc::new(TaskDb::open_in_memory().unwrap());
        let writer = task_persist_write_fn::<HookProbe>(db.clone(), "copy", true);

        writer(probe_snapshot("c1", "first", TaskState::Pending))
            .await
            .unwrap();

        // 快照与索引中的 ID 集合一致
        let snapshot = db.snapshot_read("copy").unwrap();
        assert!(snapshot.contains("c1"));
        assert_eq!(db.record_task_ids("copy").unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_write_fn_disabled_still_indexes() {
        let db = Arc::new(TaskDb::open_in_memory().unwrap());
        let writer = task_persist_write_fn::<HookProbe>(db.clone(), "upload", false);

        writer(probe_snapshot("u1", "up", TaskState::Running))
            .await
            .unwrap();

        // 索引有行，快照为空
        assert_eq!(db.record_task_ids("upload").unwrap(), vec!["u1"]);
        assert_eq!(db.snapshot_read("upload").unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_read_fn_waits_for_signal() {
        let db = Arc::new(TaskDb::open_in_memory().unwrap());
        db.snapshot_write("copy", br#"[{"id":"c1"}]"#).unwrap();

        let signal = LoadSignal::new();
        let reader = task_persist_read_fn(db, "copy", true, signal.clone()).unwrap();

        let fut = tokio::spawn(async move { reader().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!fut.is_finished());

        signal.fire();
        let bytes = fut.await.unwrap().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("c1"));
    }

    #[test]
    fn test_read_fn_disabled_is_none() {
        let db = Arc::new(TaskDb::open_in_memory().unwrap());
        assert!(task_persist_read_fn(db, "copy", false, LoadSignal::new()).is_none());
    }

    /// 崩溃重启场景：进程 A 提交后退出，进程 B 凭同一数据库恢复并跑完
    #[tokio::test]
    async fn test_crash_restart_runs_to_success() {
        use crate::task::{ManagerConfig, TaskManager};

        let db = Arc::new(TaskDb::open_in_memory().unwrap());
        let signal = LoadSignal::new();
        signal.fire();

        // 进程 A：无执行器，任务停在 Pending 后“崩溃”
        let manager_a: Arc<TaskManager<HookProbe>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 0,
                max_retry: 0,
                persist_reader: task_persist_read_fn(db.clone(), "copy", true, signal.clone()),
                persist_writer: Some(task_persist_write_fn::<HookProbe>(
                    db.clone(),
                    "copy",
                    true,
                )),
                on_restore: None,
            },
        )
        .await;
        let probe = HookProbe {
            base: TaskBase::new(),
            name: "restartable".to_string(),
        };
        probe.base.set_id("c1");
        let id = manager_a.submit(probe).await;
        assert_eq!(id, "c1");
        drop(manager_a);

        // 快照与索引中的 ID 集合一致
        assert_eq!(db.record_task_ids("copy").unwrap(), vec!["c1"]);

        // 进程 B：同一持久化函数，任务以 Pending 恢复并最终成功
        let manager_b: Arc<TaskManager<HookProbe>> = TaskManager::new(
            "copy",
            ManagerConfig {
                workers: 1,
                max_retry: 0,
                persist_reader: task_persist_read_fn(db.clone(), "copy", true, signal.clone()),
                persist_writer: Some(task_persist_write_fn::<HookProbe>(
                    db.clone(),
                    "copy",
                    true,
                )),
                on_restore: None,
            },
        )
        .await;
        let task = manager_b.get_by_id("c1").expect("任务应被恢复");
        for _ in 0..300 {
            if task.base().state() == TaskState::Succeeded {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(task.base().state(), TaskState::Succeeded);

        // 索引行收敛到成功态、进度 100（持久化在状态变更后异步落库）
        let mut rows = Vec::new();
        for _ in 0..300 {
            let (r, total) = db.list_task_records("copy", &[], 0, "", 1, 20).unwrap();
            assert_eq!(total, 1);
            if r[0].state == TaskState::Succeeded {
                rows = r;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(rows[0].task_id, "c1");
        assert_eq!(rows[0].state, TaskState::Succeeded);
        assert_eq!(rows[0].progress, 100.0);
    }
}
