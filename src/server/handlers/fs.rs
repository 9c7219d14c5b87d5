// 文件操作提交接口
//
// 接收客户端请求，构造对应任务提交给各自的管理器。
// 请求体解析保持最小化，重活都在任务执行器里。

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::driver::Obj;
use crate::tasks::{ArchiveDownloadTask, DownloadTask, FileTransferTask, TransferMode, UploadTask};

use super::super::error::{ApiError, ApiResponse, ApiResult};
use super::super::state::AppState;
use super::super::user::CurrentUser;

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub src: Obj,
    pub dst_dir: Obj,
}

/// POST /fs/copy
pub async fn submit_copy(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<ApiResponse<String>>> {
    let task = FileTransferTask::new(TransferMode::Copy, req.src, req.dst_dir, state.env.clone());
    task.base.set_creator(Some(user.creator()));
    let id = state.managers.copy.submit(task).await;
    info!("提交复制任务: {}", id);
    Ok(ApiResponse::success(id))
}

/// POST /fs/move
pub async fn submit_move(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<ApiResponse<String>>> {
    let task = FileTransferTask::new(TransferMode::Move, req.src, req.dst_dir, state.env.clone());
    task.base.set_creator(Some(user.creator()));
    let id = state.managers.mv.submit(task).await;
    info!("提交移动任务: {}", id);
    Ok(ApiResponse::success(id))
}

#[derive(Debug, Deserialize)]
pub struct OfflineDownloadRequest {
    pub urls: Vec<String>,
    pub dst_dir: Obj,
}

/// POST /fs/offline_download
pub async fn submit_offline_download(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<OfflineDownloadRequest>,
) -> ApiResult<Json<ApiResponse<Vec<String>>>> {
    if req.urls.is_empty() {
        return Err(ApiError::bad_request("urls 不能为空"));
    }
    let mut ids = Vec::with_capacity(req.urls.len());
    for url in req.urls {
        let task = DownloadTask::new(url, req.dst_dir.clone(), state.env.clone());
        task.base.set_creator(Some(user.creator()));
        ids.push(state.managers.download.submit(task).await);
    }
    info!("提交离线下载任务 {} 个", ids.len());
    Ok(ApiResponse::success(ids))
}

#[derive(Debug, Deserialize)]
pub struct DecompressRequest {
    pub src: Obj,
    pub dst_dir: Obj,
}

/// POST /fs/decompress
pub async fn submit_decompress(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<DecompressRequest>,
) -> ApiResult<Json<ApiResponse<String>>> {
    let task = ArchiveDownloadTask::new(req.src, req.dst_dir, state.env.clone());
    task.base.set_creator(Some(user.creator()));
    let id = state.managers.decompress.submit(task).await;
    info!("提交解压任务: {}", id);
    Ok(ApiResponse::success(id))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// 目标文件名
    pub name: String,
    /// 目标目录 ID
    pub dst_id: String,
    /// 目标目录路径（展示用）
    #[serde(default)]
    pub dst_path: String,
}

/// PUT /fs/upload
///
/// 请求体先落到临时目录再提交任务，避免执行器阻塞在请求连接上。
pub async fn submit_upload(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<String>>> {
    if q.name.is_empty() {
        return Err(ApiError::bad_request("缺少文件名"));
    }
    let temp_path = state
        .env
        .temp_dir
        .join(format!("upload-{}-{}", uuid::Uuid::new_v4(), q.name));
    tokio::fs::write(&temp_path, &body)
        .await
        .map_err(|e| ApiError::internal(format!("写入临时文件失败: {}", e)))?;

    let dst_dir = Obj {
        id: q.dst_id,
        path: q.dst_path,
        is_dir: true,
        ..Default::default()
    };
    let task = UploadTask::new(temp_path, q.name, dst_dir, state.env.clone());
    task.base.set_creator(Some(user.creator()));
    let id = state.managers.upload.submit(task).await;
    info!("提交上传任务: {}", id);
    Ok(ApiResponse::success(id))
}
