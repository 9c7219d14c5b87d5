// 上传缓存
//
// 一条逻辑上传在多次重试之间共享的缓存持有者：
// - cached_path: 可复用的稳定缓存文件
// - temp_file: 本次尝试的临时文件
// - keep 集合: 本次尝试结束后需要保留、不被临时目录清理的路径
// - metadata: 旁车元数据（大小/哈希/分片列表），JSON 文件落盘
//
// 所有路径在比较与存储前都经过绝对路径规范化。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 旁车元数据文件扩展名
const META_SUFFIX: &str = ".meta";

/// 上传元数据
///
/// 旧版文件中的 `upload_url` / `file_sha1` 字段在读取时折叠进
/// extras，写出时不再使用旧形态。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadMetadata {
    pub size: i64,
    pub slice_size: i64,
    pub content_md5: String,
    pub slice_md5: String,
    pub block_list: Vec<String>,
    pub extras: HashMap<String, String>,
}

impl UploadMetadata {
    /// 写入扩展项；空值表示删除
    pub fn set_extra(&mut self, key: &str, value: &str) {
        if key.is_empty() {
            return;
        }
        if value.is_empty() {
            self.extras.remove(key);
        } else {
            self.extras.insert(key.to_string(), value.to_string());
        }
    }

    /// 读取扩展项，缺失返回空串
    pub fn get_extra(&self, key: &str) -> String {
        self.extras.get(key).cloned().unwrap_or_default()
    }
}

/// 序列化形态（含旧版字段）
#[derive(Serialize, Deserialize, Default)]
struct UploadMetadataJson {
    #[serde(default)]
    size: i64,
    #[serde(default)]
    slice_size: i64,
    #[serde(default)]
    content_md5: String,
    #[serde(default)]
    slice_md5: String,
    #[serde(default)]
    block_list: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    extras: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    upload_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    file_sha1: String,
}

impl Serialize for UploadMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        UploadMetadataJson {
            size: self.size,
            slice_size: self.slice_size,
            content_md5: self.content_md5.clone(),
            slice_md5: self.slice_md5.clone(),
            block_list: self.block_list.clone(),
            extras: self.extras.clone(),
            upload_url: String::new(),
            file_sha1: String::new(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UploadMetadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let aux = UploadMetadataJson::deserialize(deserializer)?;
        let mut meta = UploadMetadata {
            size: aux.size,
            slice_size: aux.slice_size,
            content_md5: aux.content_md5,
            slice_md5: aux.slice_md5,
            block_list: aux.block_list,
            extras: aux.extras,
        };
        if !aux.upload_url.is_empty() {
            meta.set_extra("upload_url", &aux.upload_url);
        }
        if !aux.file_sha1.is_empty() {
            meta.set_extra("file_sha1", &aux.file_sha1);
        }
        Ok(meta)
    }
}

/// 绝对路径规范化；失败时保留原值
fn normalize_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// 某个临时文件对应的旁车元数据路径
pub fn metadata_path_for(path: &Path) -> PathBuf {
    let normalized = normalize_path(path);
    let mut s = normalized.into_os_string();
    s.push(META_SUFFIX);
    PathBuf::from(s)
}

/// 按稳定键派生旁车元数据路径：`<temp_dir>/upload-<safe(key)>.meta`
///
/// key 中 `[A-Za-z0-9_-]` 以外的字符替换为 `_`；空键退化为时间戳。
pub fn metadata_path_for_key(temp_dir: &Path, key: &str) -> PathBuf {
    let key = key.trim();
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = if safe.is_empty() {
        format!(
            "anon-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    } else {
        safe
    };
    temp_dir.join(format!("upload-{}{}", safe, META_SUFFIX))
}

struct Inner {
    cached_path: Option<PathBuf>,
    temp_file: Option<PathBuf>,
    keep: HashSet<PathBuf>,
    metadata: Option<UploadMetadata>,
    metadata_path: Option<PathBuf>,
    retain_meta: bool,
}

impl Inner {
    fn current_path(&self) -> Option<&PathBuf> {
        self.temp_file.as_ref().or(self.cached_path.as_ref())
    }

    fn metadata_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.metadata_path {
            return Some(path.clone());
        }
        self.current_path().map(|p| metadata_path_for(p))
    }
}

/// 上传缓存持有者
///
/// 所有公开操作并发安全。
pub struct UploadCache {
    inner: RwLock<Inner>,
}

impl UploadCache {
    /// 创建缓存持有者，可选携带已有的缓存文件路径
    pub fn new(path: Option<&Path>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                cached_path: path.map(normalize_path),
                temp_file: None,
                keep: HashSet::new(),
                metadata: None,
                metadata_path: None,
                retain_meta: false,
            }),
        }
    }

    /// 固定旁车元数据位置为按键派生的路径（与临时文件路径无关）
    pub fn with_metadata_key(self, temp_dir: &Path, key: &str) -> Self {
        if !key.is_empty() {
            self.inner.write().unwrap().metadata_path =
                Some(metadata_path_for_key(temp_dir, key));
        }
        self
    }

    pub fn cached_path(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().cached_path.clone()
    }

    /// 设置可复用缓存路径；同时失效内存中的元数据
    pub fn set_cached_path(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        inner.cached_path = Some(normalize_path(path));
        inner.metadata = None;
    }

    /// 登记本次尝试的临时文件；同时失效内存中的元数据
    pub fn register_temp(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        inner.temp_file = Some(normalize_path(path));
        inner.metadata = None;
    }

    pub fn temp_file(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().temp_file.clone()
    }

    /// 当前生效路径：优先临时文件，其次缓存文件
    pub fn current_path(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().current_path().cloned()
    }

    /// 标记路径在本次尝试结束后保留
    pub fn mark_keep(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        self.inner.write().unwrap().keep.insert(normalize_path(path));
    }

    /// 路径是否应当保留：等于缓存路径，或曾被 mark_keep
    pub fn should_keep(&self, path: &Path) -> bool {
        if path.as_os_str().is_empty() {
            return false;
        }
        let normalized = normalize_path(path);
        let inner = self.inner.read().unwrap();
        if inner.cached_path.as_ref() == Some(&normalized) {
            return true;
        }
        inner.keep.contains(&normalized)
    }

    /// 旁车元数据文件路径（无已知路径时为 None）
    pub fn metadata_path(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().metadata_path()
    }

    /// 内存中元数据的拷贝
    pub fn metadata(&self) -> Option<UploadMetadata> {
        self.inner.read().unwrap().metadata.clone()
    }

    /// 惰性加载元数据
    ///
    /// 内存中已有时直接返回拷贝；否则从旁车文件读取并缓存。
    /// 没有任何已知路径时返回 NotFound。
    pub fn load_metadata(&self) -> io::Result<UploadMetadata> {
        let mut inner = self.inner.write().unwrap();
        if let Some(meta) = &inner.metadata {
            return Ok(meta.clone());
        }
        let path = inner
            .metadata_path()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let data = fs::read(&path)?;
        let meta: UploadMetadata = serde_json::from_slice(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        inner.metadata = Some(meta.clone());
        Ok(meta)
    }

    /// 保存元数据：内存保留一份拷贝并写入旁车文件（0600）
    ///
    /// 传 None 清空内存并删除旁车文件。
    pub fn save_metadata(&self, meta: Option<&UploadMetadata>) -> io::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(meta) = meta else {
            inner.metadata = None;
            if let Some(path) = inner.metadata_path() {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        };

        inner.metadata = Some(meta.clone());
        let Some(path) = inner.metadata_path() else {
            return Ok(());
        };
        let data = serde_json::to_vec(meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// 删除旁车元数据文件（不存在不算错）
    pub fn remove_metadata_file(&self) -> io::Result<()> {
        let Some(path) = self.metadata_path() else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 标记元数据在任务失败后仍需保留
    pub fn mark_retain_metadata(&self) {
        self.inner.write().unwrap().retain_meta = true;
    }

    pub fn should_retain_metadata(&self) -> bool {
        self.inner.read().unwrap().retain_meta
    }
}

/// 删除某个临时文件对应的旁车元数据
pub fn remove_metadata_by_path(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    let _ = fs::remove_file(metadata_path_for(path));
}

/// 删除指定位置的旁车元数据
pub fn remove_metadata_file_at(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    let _ = fs::remove_file(path);
}
