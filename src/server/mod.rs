// Web 服务器模块

pub mod error;
pub mod handlers;
pub mod state;
pub mod user;

pub use error::{ApiError, ApiResponse, ApiResult};
pub use state::{AppState, Managers};
pub use user::CurrentUser;

use axum::routing::{post, put};
use axum::Router;

use handlers::task::{task_routes, KindState};

/// 组装全部路由
///
/// 任务控制面挂在 /api/task/<kind> 下；upload 与 decompress_upload
/// 的任务集在内存里就是全量，不走索引表。
pub fn build_router(state: AppState) -> Router {
    let db = Some(state.db.clone());

    let task_router = Router::new()
        .nest(
            "/upload",
            task_routes(KindState {
                manager: state.managers.upload.clone(),
                db: db.clone(),
                kind: "upload",
                use_index: false,
            }),
        )
        .nest(
            "/copy",
            task_routes(KindState {
                manager: state.managers.copy.clone(),
                db: db.clone(),
                kind: "copy",
                use_index: true,
            }),
        )
        .nest(
            "/move",
            task_routes(KindState {
                manager: state.managers.mv.clone(),
                db: db.clone(),
                kind: "move",
                use_index: true,
            }),
        )
        .nest(
            "/offline_download",
            task_routes(KindState {
                manager: state.managers.download.clone(),
                db: db.clone(),
                kind: "download",
                use_index: true,
            }),
        )
        .nest(
            "/offline_download_transfer",
            task_routes(KindState {
                manager: state.managers.transfer.clone(),
                db: db.clone(),
                kind: "transfer",
                use_index: true,
            }),
        )
        .nest(
            "/decompress",
            task_routes(KindState {
                manager: state.managers.decompress.clone(),
                db: db.clone(),
                kind: "decompress",
                use_index: true,
            }),
        )
        .nest(
            "/decompress_upload",
            task_routes(KindState {
                manager: state.managers.decompress_upload.clone(),
                db,
                kind: "decompress_upload",
                use_index: false,
            }),
        );

    let fs_router = Router::new()
        .route("/copy", post(handlers::fs::submit_copy))
        .route("/move", post(handlers::fs::submit_move))
        .route("/offline_download", post(handlers::fs::submit_offline_download))
        .route("/decompress", post(handlers::fs::submit_decompress))
        .route("/upload", put(handlers::fs::submit_upload))
        .with_state(state);

    Router::new()
        .nest("/api/task", task_router)
        .nest("/api/fs", fs_router)
        .layer(axum::middleware::from_fn(user::inject_user))
}
