// 任务状态与创建者定义

use serde::{Deserialize, Serialize};

/// 管理员角色值
pub const ROLE_ADMIN: i32 = 2;

/// 任务状态
///
/// 状态以整数持久化（快照与索引表共用同一编码），
/// 因此枚举值的顺序一旦发布就不能再调整。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum TaskState {
    /// 等待调度
    Pending,
    /// 执行中
    Running,
    /// 成功
    Succeeded,
    /// 取消中（已发出取消信号，等待执行器确认）
    Canceling,
    /// 已取消
    Canceled,
    /// 出错（仍可能重试）
    Errored,
    /// 即将失败（重试次数耗尽）
    Failing,
    /// 已失败
    Failed,
    /// 等待重试（退避中）
    WaitingRetry,
    /// 重试前置
    BeforeRetry,
}

impl TaskState {
    /// 是否为终态（只有用户显式重试才能离开）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Canceled | TaskState::Failed
        )
    }

    /// 未完成状态集合（用于 /undone 列表）
    pub fn undone() -> &'static [TaskState] {
        &[
            TaskState::Pending,
            TaskState::Running,
            TaskState::Canceling,
            TaskState::Errored,
            TaskState::Failing,
            TaskState::WaitingRetry,
            TaskState::BeforeRetry,
        ]
    }

    /// 已完成状态集合（用于 /done 列表）
    pub fn done() -> &'static [TaskState] {
        &[TaskState::Canceled, TaskState::Failed, TaskState::Succeeded]
    }
}

impl From<TaskState> for i32 {
    fn from(s: TaskState) -> i32 {
        match s {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Succeeded => 2,
            TaskState::Canceling => 3,
            TaskState::Canceled => 4,
            TaskState::Errored => 5,
            TaskState::Failing => 6,
            TaskState::Failed => 7,
            TaskState::WaitingRetry => 8,
            TaskState::BeforeRetry => 9,
        }
    }
}

impl From<i32> for TaskState {
    fn from(v: i32) -> TaskState {
        match v {
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            3 => TaskState::Canceling,
            4 => TaskState::Canceled,
            5 => TaskState::Errored,
            6 => TaskState::Failing,
            7 => TaskState::Failed,
            8 => TaskState::WaitingRetry,
            9 => TaskState::BeforeRetry,
            _ => TaskState::Pending,
        }
    }
}

/// 任务创建者
///
/// 系统触发的任务没有创建者（`Option::None`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    /// 用户 ID
    pub id: u64,
    /// 用户名
    pub username: String,
    /// 角色值
    pub role: i32,
}

impl Creator {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_int_roundtrip() {
        for v in 0..10 {
            let state = TaskState::from(v);
            assert_eq!(i32::from(state), v);
        }
        // 未知值回落到 Pending
        assert_eq!(TaskState::from(42), TaskState::Pending);
    }

    #[test]
    fn test_state_json_is_int() {
        let json = serde_json::to_string(&TaskState::Canceled).unwrap();
        assert_eq!(json, "4");
        let back: TaskState = serde_json::from_str("8").unwrap();
        assert_eq!(back, TaskState::WaitingRetry);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Canceling.is_terminal());
        assert!(!TaskState::WaitingRetry.is_terminal());
    }

    #[test]
    fn test_undone_done_partition() {
        // 10 个状态被 undone/done 完整划分
        assert_eq!(TaskState::undone().len() + TaskState::done().len(), 10);
        for s in TaskState::undone() {
            assert!(!s.is_terminal());
        }
        for s in TaskState::done() {
            assert!(s.is_terminal());
        }
    }
}
