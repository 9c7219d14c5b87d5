// 任务视图
//
// HTTP 层与索引表共用的扁平结构，由在内存中的任务或索引行构造。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::base::Task;
use super::state::TaskState;

/// 任务对外视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    /// 任务 ID
    pub id: String,
    /// 展示名称
    pub name: String,
    /// 创建者用户名（系统任务为空）
    pub creator: String,
    /// 创建者用户 ID（系统任务为 0）
    pub creator_id: u64,
    /// 创建者角色（系统任务为 -1）
    pub creator_role: i32,
    /// 状态
    pub state: TaskState,
    /// 短状态消息
    pub status: String,
    /// 进度百分比，NaN 已折算为 100
    pub progress: f64,
    /// 开始时间
    pub start_time: Option<DateTime<Utc>>,
    /// 结束时间
    pub end_time: Option<DateTime<Utc>>,
    /// 总字节数
    pub total_bytes: i64,
    /// 错误信息
    pub error: String,
}

impl TaskView {
    /// 从在内存中的任务构造视图
    pub fn of<T: Task + ?Sized>(task: &T) -> Self {
        let base = task.base();
        let progress = base.progress();
        let progress = if progress.is_nan() { 100.0 } else { progress };
        let (creator, creator_id, creator_role) = match base.creator() {
            Some(c) => (c.username, c.id, c.role),
            None => (String::new(), 0, -1),
        };
        Self {
            id: base.id(),
            name: task.name(),
            creator,
            creator_id,
            creator_role,
            state: base.state(),
            status: base.status(),
            progress,
            start_time: base.start_time(),
            end_time: base.end_time(),
            total_bytes: base.total_bytes(),
            error: base.err().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::base::TaskBase;

    struct ViewProbe {
        base: TaskBase,
    }

    #[async_trait::async_trait]
    impl Task for ViewProbe {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn name(&self) -> String {
            "probe".to_string()
        }

        async fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_nan_progress_reported_as_100() {
        let probe = ViewProbe {
            base: TaskBase::new(),
        };
        probe.base.set_progress(f64::NAN);
        let view = TaskView::of(&probe);
        assert_eq!(view.progress, 100.0);
    }

    #[test]
    fn test_system_task_has_no_creator() {
        let probe = ViewProbe {
            base: TaskBase::new(),
        };
        let view = TaskView::of(&probe);
        assert_eq!(view.creator, "");
        assert_eq!(view.creator_id, 0);
        assert_eq!(view.creator_role, -1);
    }
}
