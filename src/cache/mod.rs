// 上传缓存模块

pub mod upload_cache;

pub use upload_cache::{
    metadata_path_for, metadata_path_for_key, remove_metadata_by_path, remove_metadata_file_at,
    UploadCache, UploadMetadata,
};
