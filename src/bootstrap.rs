// 启动装配
//
// 打开数据库、构造驱动与任务环境、按配置创建七个任务管理器并
// 挂接持久化钩子，最后把各管理器现状同步进索引表，让第一次
// 列表查询就能走索引。

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{AppConfig, TaskTypeConfig};
use crate::drivers::polar::{PolarClient, PolarDriver};
use crate::persistence::{task_persist_read_fn, task_persist_write_fn, LoadSignal, TaskDb};
use crate::server::{AppState, Managers};
use crate::task::{ManagerConfig, PersistableTask, RestoreHook, TaskManager, TaskView};
use crate::tasks::{
    ArchiveContentUploadTask, ArchiveDownloadTask, DownloadTask, FileTransferTask, TaskEnv,
    TransferTask, UploadTask,
};

/// 持久化开关表（与快照表的 key 一致）
const PERSISTED_KINDS: [&str; 5] = ["copy", "move", "download", "transfer", "decompress"];

/// 装配应用状态
pub async fn init_state(config: AppConfig) -> Result<AppState> {
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .with_context(|| format!("创建临时目录失败: {:?}", config.temp_dir))?;

    let db = Arc::new(TaskDb::new(&config.database.path)?);
    let signal = LoadSignal::new();

    // 驱动与任务环境
    let client = PolarClient::new(&config.driver.base_url, &config.driver.token)?;
    let rate_limit = (config.driver.upload_rate_limit > 0).then_some(config.driver.upload_rate_limit);
    let driver = Arc::new(PolarDriver::new(client).with_upload_rate_limit(rate_limit));
    let env = Arc::new(TaskEnv::new(driver, config.temp_dir.clone()));

    // 旧版表：补种缺失行，关闭持久化的类型清空
    db.seed_task_items(&PERSISTED_KINDS)?;
    clear_disabled_task_data(&db, &config);

    // 存储（驱动）就绪，放行快照读取
    signal.fire();

    let tasks = &config.tasks;

    // 下游管理器先建好，再建会向它们投递任务的管理器
    let transfer = make_manager::<TransferTask>(
        &db, &signal, "transfer", tasks.transfer, attach_env_hook(&env, TransferTask::attach_env),
    )
    .await;
    env.set_transfer_manager(transfer.clone());

    let decompress_upload = make_manager::<ArchiveContentUploadTask>(
        &db,
        &signal,
        "decompress_upload",
        tasks.decompress_upload,
        attach_env_hook(&env, ArchiveContentUploadTask::attach_env),
    )
    .await;
    env.set_archive_upload_manager(decompress_upload.clone());

    let upload = make_manager::<UploadTask>(
        &db, &signal, "upload", tasks.upload, attach_env_hook(&env, UploadTask::attach_env),
    )
    .await;
    let copy = make_manager::<FileTransferTask>(
        &db, &signal, "copy", tasks.copy, attach_env_hook(&env, FileTransferTask::attach_env),
    )
    .await;
    let mv = make_manager::<FileTransferTask>(
        &db, &signal, "move", tasks.mv, attach_env_hook(&env, FileTransferTask::attach_env),
    )
    .await;
    let download = make_manager::<DownloadTask>(
        &db, &signal, "download", tasks.download, attach_env_hook(&env, DownloadTask::attach_env),
    )
    .await;
    let decompress = make_manager::<ArchiveDownloadTask>(
        &db,
        &signal,
        "decompress",
        tasks.decompress,
        attach_env_hook(&env, ArchiveDownloadTask::attach_env),
    )
    .await;

    // 有待转存的任务时不动临时目录，它们的数据就在里面
    if transfer.get_all().is_empty() {
        clean_temp_dir(&config.temp_dir);
    }

    // 启动即同步索引，首次列表查询走热表
    sync_task_index(&db, "upload", &upload);
    sync_task_index(&db, "copy", &copy);
    sync_task_index(&db, "move", &mv);
    sync_task_index(&db, "download", &download);
    sync_task_index(&db, "transfer", &transfer);
    sync_task_index(&db, "decompress", &decompress);
    sync_task_index(&db, "decompress_upload", &decompress_upload);

    info!("任务管理器装配完成");
    Ok(AppState {
        managers: Managers {
            upload,
            copy,
            mv,
            download,
            transfer,
            decompress,
            decompress_upload,
        },
        db,
        env,
        config,
    })
}

/// 构造单个管理器并挂接持久化钩子
async fn make_manager<T: PersistableTask>(
    db: &Arc<TaskDb>,
    signal: &LoadSignal,
    kind: &'static str,
    cfg: TaskTypeConfig,
    on_restore: RestoreHook<T>,
) -> Arc<TaskManager<T>> {
    TaskManager::new(
        kind,
        ManagerConfig {
            workers: cfg.workers,
            max_retry: cfg.max_retry,
            persist_reader: task_persist_read_fn(
                db.clone(),
                kind,
                cfg.task_persistent,
                signal.clone(),
            ),
            persist_writer: Some(task_persist_write_fn::<T>(
                db.clone(),
                kind,
                cfg.task_persistent,
            )),
            on_restore: Some(on_restore),
        },
    )
    .await
}

/// 生成恢复钩子：给快照恢复出的任务重新挂接运行环境
fn attach_env_hook<T: 'static>(env: &Arc<TaskEnv>, attach: fn(&T, Arc<TaskEnv>)) -> RestoreHook<T> {
    let env = env.clone();
    Arc::new(move |task: &T| attach(task, env.clone()))
}

/// 关闭持久化的类型把旧版行重置为空数组
fn clear_disabled_task_data(db: &TaskDb, config: &AppConfig) {
    let tasks = &config.tasks;
    let enabled = [
        ("copy", tasks.copy.task_persistent),
        ("move", tasks.mv.task_persistent),
        ("download", tasks.download.task_persistent),
        ("transfer", tasks.transfer.task_persistent),
        ("decompress", tasks.decompress.task_persistent),
    ];
    for (kind, enabled) in enabled {
        if !enabled {
            if let Err(e) = db.upsert_task_item(kind, "[]") {
                warn!("清空 {} 旧版任务数据失败: {:#}", kind, e);
            }
        }
    }
}

/// 清空临时目录
fn clean_temp_dir(temp_dir: &Path) {
    let entries = match std::fs::read_dir(temp_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取临时目录失败: {:?}, 错误: {}", temp_dir, e);
            return;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!("清理临时文件失败: {:?}, 错误: {}", path, e),
        }
    }
    if removed > 0 {
        info!("已清理临时目录 {} 项", removed);
    }
}

/// 把管理器现状整体刷进索引表
fn sync_task_index<T: PersistableTask>(db: &TaskDb, kind: &str, manager: &TaskManager<T>) {
    let views: Vec<TaskView> = manager
        .get_all()
        .iter()
        .map(|t| TaskView::of(t.as_ref()))
        .collect();
    if let Err(e) = db.upsert_task_records_from_views(kind, &views) {
        warn!("同步 {} 任务索引失败: {:#}", kind, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, TasksConfig};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                path: dir.path().join("tasks.db"),
            },
            temp_dir: dir.path().join("temp"),
            tasks: TasksConfig::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_state_builds_all_managers() {
        let dir = TempDir::new().unwrap();
        let state = init_state(test_config(&dir)).await.unwrap();

        assert_eq!(state.managers.copy.kind(), "copy");
        assert_eq!(state.managers.decompress_upload.kind(), "decompress_upload");
        assert!(state.config.temp_dir.exists());
        // 旧版行已补种
        assert_eq!(state.db.get_task_item("copy").unwrap().unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_disabled_kind_resets_legacy_row() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.tasks.copy.task_persistent = false;

        // 先放一条旧数据再启动
        {
            let db = TaskDb::new(&config.database.path).unwrap();
            db.upsert_task_item("copy", r#"[{"id":"stale"}]"#).unwrap();
        }
        let state = init_state(config).await.unwrap();
        assert_eq!(state.db.get_task_item("copy").unwrap().unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_temp_dir_cleaned_when_no_transfers() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::create_dir_all(&config.temp_dir).unwrap();
        let leftover = config.temp_dir.join("leftover.bin");
        std::fs::write(&leftover, b"junk").unwrap();

        init_state(config).await.unwrap();
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_temp_dir_preserved_when_transfers_pending() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::create_dir_all(&config.temp_dir).unwrap();
        let staged = config.temp_dir.join("staged.bin");
        std::fs::write(&staged, b"payload").unwrap();

        // 数据库里预置一个待转存任务的快照
        {
            let db = TaskDb::new(&config.database.path).unwrap();
            let snapshot = serde_json::json!([{
                "id": "tr1", "state": 0,
                "file_path": staged,
                "dst_dir": {"id": "d1", "name": "", "path": "/dst", "size": 0,
                            "is_dir": true, "modified": null},
            }])
            .to_string();
            db.snapshot_write("transfer", snapshot.as_bytes()).unwrap();
        }

        // 转存执行器设为 0，任务保持 Pending，临时文件不能被清掉
        let mut config = config;
        config.tasks.transfer.workers = 0;
        let state = init_state(config).await.unwrap();

        assert_eq!(state.managers.transfer.get_all().len(), 1);
        assert!(staged.exists());
    }
}
