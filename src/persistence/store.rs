// 任务持久化存储
//
// 两张相互配合的表：
// - task_persist: 按任务一行的快照表，调度器崩溃恢复用，整体替换写入
// - task_records: 反范式化的索引表，列表接口的分页/过滤/鉴权查询用
// 另保留旧版单行 task_items 表：只读兼容，外加关闭持久化类型的清空写入。

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::value::RawValue;
use tracing::debug;

use crate::task::{TaskState, TaskView};

/// 索引表批量写入的单批行数
const RECORD_BATCH_SIZE: usize = 500;

/// 列表查询默认页大小
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// 列表查询页大小上限
pub const MAX_PAGE_SIZE: usize = 200;

/// 任务索引行
#[derive(Debug, Clone)]
pub struct TaskRecordRow {
    pub task_id: String,
    pub kind: String,
    pub name: String,
    pub creator: String,
    pub creator_id: u64,
    pub creator_role: i32,
    pub state: TaskState,
    pub status: String,
    pub progress: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_bytes: i64,
    pub error: String,
}

impl From<TaskRecordRow> for TaskView {
    fn from(r: TaskRecordRow) -> Self {
        TaskView {
            id: r.task_id,
            name: r.name,
            creator: r.creator,
            creator_id: r.creator_id,
            creator_role: r.creator_role,
            state: r.state,
            status: r.status,
            progress: r.progress,
            start_time: r.start_time,
            end_time: r.end_time,
            total_bytes: r.total_bytes,
            error: r.error,
        }
    }
}

/// 任务数据库
pub struct TaskDb {
    conn: Mutex<Connection>,
}

impl TaskDb {
    /// 打开（或创建）数据库文件
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("打开任务数据库失败: {:?}", db_path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 初始化表结构
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        // 快照表：每个任务一行，按类型整体替换
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS task_persist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                task_id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_persist_key_id ON task_persist(key, task_id)",
            [],
        )?;

        // 索引表：列表接口直查
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS task_records (
                task_id TEXT NOT NULL,
                type TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                creator TEXT NOT NULL DEFAULT '',
                creator_id INTEGER NOT NULL DEFAULT 0,
                creator_role INTEGER NOT NULL DEFAULT -1,
                state INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT '',
                progress REAL NOT NULL DEFAULT 0,
                start_time INTEGER,
                end_time INTEGER,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (task_id, type)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_records_type_state ON task_records(type, state)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_records_creator_id ON task_records(type, creator_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_records_start_time ON task_records(type, start_time)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_records_end_time ON task_records(type, end_time)",
            [],
        )?;

        // 旧版单行快照表
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS task_items (
                key TEXT PRIMARY KEY,
                persist_data TEXT NOT NULL DEFAULT ''
            )
            "#,
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    // ========================================================================
    // 快照表
    // ========================================================================

    /// 写入某类型的任务快照（整体替换）
    ///
    /// 输入为 JSON 数组；空串、`null`、`[]` 视为清空该类型。
    /// 每个元素依次尝试 `id`、`task_id` 提取稳定 ID，都没有时用
    /// `<kind>-<下标>` 兜底。
    pub fn snapshot_write(&self, kind: &str, data: &[u8]) -> Result<()> {
        let trimmed = std::str::from_utf8(data).unwrap_or("").trim();
        if trimmed.is_empty() || trimmed == "null" || trimmed == "[]" {
            self.lock_conn()?
                .execute("DELETE FROM task_persist WHERE key = ?1", params![kind])?;
            return Ok(());
        }

        let raws: Vec<&RawValue> =
            serde_json::from_str(trimmed).context("解析任务快照失败")?;

        #[derive(serde::Deserialize, Default)]
        struct IdProbe {
            #[serde(default)]
            id: String,
            #[serde(default)]
            task_id: String,
        }

        let now = Utc::now().timestamp();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM task_persist WHERE key = ?1", params![kind])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO task_persist (key, task_id, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (i, raw) in raws.iter().enumerate() {
                let probe: IdProbe =
                    serde_json::from_str(raw.get()).unwrap_or_default();
                let task_id = if !probe.id.is_empty() {
                    probe.id
                } else if !probe.task_id.is_empty() {
                    probe.task_id
                } else {
                    format!("{}-{}", kind, i)
                };
                stmt.execute(params![kind, task_id, raw.get(), now, now])?;
            }
        }
        tx.commit()?;

        debug!("写入 {} 任务快照 {} 行", kind, raws.len());
        Ok(())
    }

    /// 读取某类型的任务快照
    ///
    /// 按 updated_at 倒序拼接各行原始 JSON 为一个数组；无数据返回 `[]`。
    pub fn snapshot_read(&self, kind: &str) -> Result<String> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM task_persist WHERE key = ?1 ORDER BY updated_at DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;

        let mut buf = String::from("[");
        let mut first = true;
        for data in rows {
            if !first {
                buf.push(',');
            }
            buf.push_str(&data?);
            first = false;
        }
        buf.push(']');
        Ok(buf)
    }

    // ========================================================================
    // 索引表
    // ========================================================================

    /// 用任务视图整体刷新某类型的索引行
    ///
    /// 单个事务内先删后写，主键冲突时覆盖，按批提交避免超长语句。
    pub fn upsert_task_records_from_views(&self, kind: &str, views: &[TaskView]) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM task_records WHERE type = ?1", params![kind])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO task_records
                    (task_id, type, name, creator, creator_id, creator_role, state,
                     status, progress, start_time, end_time, total_bytes, error,
                     created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT (task_id, type) DO UPDATE SET
                    name = excluded.name,
                    creator = excluded.creator,
                    creator_id = excluded.creator_id,
                    creator_role = excluded.creator_role,
                    state = excluded.state,
                    status = excluded.status,
                    progress = excluded.progress,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    total_bytes = excluded.total_bytes,
                    error = excluded.error,
                    updated_at = excluded.updated_at
                "#,
            )?;
            for chunk in views.chunks(RECORD_BATCH_SIZE) {
                for v in chunk {
                    stmt.execute(params![
                        v.id,
                        kind,
                        v.name,
                        v.creator,
                        v.creator_id as i64,
                        v.creator_role,
                        i32::from(v.state),
                        v.status,
                        v.progress,
                        v.start_time.map(|t| t.timestamp()),
                        v.end_time.map(|t| t.timestamp()),
                        v.total_bytes,
                        v.error,
                        now,
                        now,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// 分页查询任务索引
    ///
    /// `keyword` 为名称的子串过滤（LIKE）；`creator_id` 为 0 表示不过滤。
    /// 排序：COALESCE(end_time, start_time) 倒序，task_id 倒序兜底。
    pub fn list_task_records(
        &self,
        kind: &str,
        states: &[TaskState],
        creator_id: u64,
        keyword: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<TaskRecordRow>, i64)> {
        let page = page.max(1);
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        let offset = (page - 1) * page_size;

        let mut where_sql = String::from("type = ?");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(kind.to_string())];

        if !states.is_empty() {
            let placeholders = vec!["?"; states.len()].join(", ");
            where_sql.push_str(&format!(" AND state IN ({})", placeholders));
            for s in states {
                args.push(Box::new(i32::from(*s)));
            }
        }
        if creator_id != 0 {
            where_sql.push_str(" AND creator_id = ?");
            args.push(Box::new(creator_id as i64));
        }
        if !keyword.is_empty() {
            where_sql.push_str(" AND name LIKE ?");
            args.push(Box::new(format!("%{}%", keyword)));
        }

        let conn = self.lock_conn()?;

        let count_sql = format!("SELECT COUNT(*) FROM task_records WHERE {}", where_sql);
        let total: i64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        let list_sql = format!(
            r#"
            SELECT task_id, type, name, creator, creator_id, creator_role, state,
                   status, progress, start_time, end_time, total_bytes, error
            FROM task_records
            WHERE {}
            ORDER BY COALESCE(end_time, start_time) DESC, task_id DESC
            LIMIT ? OFFSET ?
            "#,
            where_sql
        );
        args.push(Box::new(page_size as i64));
        args.push(Box::new(offset as i64));

        let mut stmt = conn.prepare(&list_sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| {
                Ok(TaskRecordRow {
                    task_id: row.get(0)?,
                    kind: row.get(1)?,
                    name: row.get(2)?,
                    creator: row.get(3)?,
                    creator_id: row.get::<_, i64>(4)? as u64,
                    creator_role: row.get(5)?,
                    state: TaskState::from(row.get::<_, i32>(6)?),
                    status: row.get(7)?,
                    progress: row.get(8)?,
                    start_time: row
                        .get::<_, Option<i64>>(9)?
                        .and_then(|t| DateTime::from_timestamp(t, 0)),
                    end_time: row
                        .get::<_, Option<i64>>(10)?
                        .and_then(|t| DateTime::from_timestamp(t, 0)),
                    total_bytes: row.get(11)?,
                    error: row.get(12)?,
                })
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok((records, total))
    }

    /// 某类型索引表中的全部任务 ID（测试与一致性检查用）
    pub fn record_task_ids(&self, kind: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT task_id FROM task_records WHERE type = ?1 ORDER BY task_id")?;
        let rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ========================================================================
    // 旧版 task_items 表
    // ========================================================================

    /// 读取旧版单行快照
    pub fn get_task_item(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let data = conn
            .query_row(
                "SELECT persist_data FROM task_items WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(data)
    }

    /// 写入旧版单行快照（仅用于初始化与关闭持久化类型的清空）
    pub fn upsert_task_item(&self, key: &str, persist_data: &str) -> Result<()> {
        self.lock_conn()?.execute(
            "INSERT INTO task_items (key, persist_data) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET persist_data = excluded.persist_data",
            params![key, persist_data],
        )?;
        Ok(())
    }

    /// 补种缺失的旧版行（已有的不动）
    pub fn seed_task_items(&self, keys: &[&str]) -> Result<()> {
        let conn = self.lock_conn()?;
        for key in keys {
            conn.execute(
                "INSERT OR IGNORE INTO task_items (key, persist_data) VALUES (?1, '[]')",
                params![key],
            )?;
        }
        Ok(())
    }
}
