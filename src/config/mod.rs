// 配置管理模块

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// 各类任务配置
    #[serde(default)]
    pub tasks: TasksConfig,
    /// 临时目录
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 后端驱动配置
    #[serde(default)]
    pub driver: DriverConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS 允许的源
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5244,
            cors_origins: vec![],
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite 数据库文件路径
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/tasks.db"),
        }
    }
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("data/temp")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            tasks: TasksConfig::default(),
            temp_dir: default_temp_dir(),
            log: LogConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

/// 单类任务配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskTypeConfig {
    /// 执行器数量
    pub workers: usize,
    /// 最大自动重试次数
    pub max_retry: u32,
    /// 是否持久化任务快照
    pub task_persistent: bool,
}

impl TaskTypeConfig {
    fn new(workers: usize, max_retry: u32, task_persistent: bool) -> Self {
        Self {
            workers,
            max_retry,
            task_persistent,
        }
    }
}

/// 各类任务配置
///
/// upload 与 decompress_upload 的源数据在临时目录里活不过重启，
/// 快照持久化默认关闭。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "TasksConfig::default_upload")]
    pub upload: TaskTypeConfig,
    #[serde(default = "TasksConfig::default_copy")]
    pub copy: TaskTypeConfig,
    #[serde(default = "TasksConfig::default_move", rename = "move")]
    pub mv: TaskTypeConfig,
    #[serde(default = "TasksConfig::default_download")]
    pub download: TaskTypeConfig,
    #[serde(default = "TasksConfig::default_transfer")]
    pub transfer: TaskTypeConfig,
    #[serde(default = "TasksConfig::default_decompress")]
    pub decompress: TaskTypeConfig,
    #[serde(default = "TasksConfig::default_decompress_upload")]
    pub decompress_upload: TaskTypeConfig,
}

impl TasksConfig {
    fn default_upload() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 0, false)
    }

    fn default_copy() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 2, true)
    }

    fn default_move() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 2, true)
    }

    fn default_download() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 1, true)
    }

    fn default_transfer() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 2, true)
    }

    fn default_decompress() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 2, true)
    }

    fn default_decompress_upload() -> TaskTypeConfig {
        TaskTypeConfig::new(5, 0, false)
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            upload: Self::default_upload(),
            copy: Self::default_copy(),
            mv: Self::default_move(),
            download: Self::default_download(),
            transfer: Self::default_transfer(),
            decompress: Self::default_decompress(),
            decompress_upload: Self::default_decompress_upload(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写日志文件
    pub enabled: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志级别
    pub level: String,
    /// 保留天数
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            retention_days: 7,
        }
    }
}

/// 后端驱动配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// 后端 API 地址
    pub base_url: String,
    /// 访问令牌
    pub token: String,
    /// 上传限速（字节/秒），0 不限速
    #[serde(default)]
    pub upload_rate_limit: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polar.example.com".to_string(),
            token: String::new(),
            upload_rate_limit: 0,
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置，不存在或解析失败时使用默认值
    pub async fn load_or_default(path: &str) -> AppConfig {
        match fs::read_to_string(path).await {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("解析配置文件失败，使用默认配置: {}", e);
                    AppConfig::default()
                }
            },
            Err(_) => AppConfig::default(),
        }
    }

    /// 加载配置，文件必须存在且合法
    pub async fn load(path: &str) -> Result<AppConfig> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;
        toml::from_str(&content).context("解析配置文件失败")
    }
}
