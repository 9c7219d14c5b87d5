// 复制 / 移动任务
//
// 同一任务类型服务 copy 与 move 两个管理器，载荷里区分模式。

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::driver::Obj;
use crate::task::{Task, TaskBase};

use super::env::TaskEnv;

/// 转移模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

/// 文件复制/移动任务
#[derive(Serialize, Deserialize)]
pub struct FileTransferTask {
    #[serde(flatten)]
    pub base: Arc<TaskBase>,
    pub mode: TransferMode,
    /// 源对象
    pub src: Obj,
    /// 目标目录
    pub dst_dir: Obj,
    #[serde(skip)]
    env: OnceLock<Arc<TaskEnv>>,
}

impl FileTransferTask {
    pub fn new(mode: TransferMode, src: Obj, dst_dir: Obj, env: Arc<TaskEnv>) -> Self {
        let task = Self {
            base: Arc::new(TaskBase::new()),
            mode,
            src,
            dst_dir,
            env: OnceLock::new(),
        };
        let _ = task.env.set(env);
        task
    }

    pub fn attach_env(&self, env: Arc<TaskEnv>) {
        let _ = self.env.set(env);
    }

    fn env(&self) -> Result<&Arc<TaskEnv>> {
        self.env.get().context("任务环境未初始化")
    }
}

#[async_trait::async_trait]
impl Task for FileTransferTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn name(&self) -> String {
        let verb = match self.mode {
            TransferMode::Copy => "copy",
            TransferMode::Move => "move",
        };
        format!("{} [{}] to [{}]", verb, self.src.path, self.dst_dir.path)
    }

    async fn run(&self) -> Result<()> {
        let env = self.env()?;
        self.base.set_total_bytes(self.src.size);
        match self.mode {
            TransferMode::Copy => {
                self.base.set_status("copying");
                env.driver
                    .copy(&self.src, &self.dst_dir)
                    .await
                    .with_context(|| format!("复制 {} 失败", self.src.path))?;
            }
            TransferMode::Move => {
                self.base.set_status("moving");
                env.driver
                    .move_obj(&self.src, &self.dst_dir)
                    .await
                    .with_context(|| format!("移动 {} 失败", self.src.path))?;
            }
        }
        Ok(())
    }
}
