// 任务控制接口
//
// 每类任务一组路由：分页列表（undone/done）、单个操作
// （info/cancel/delete/retry）、批量操作（*_some）、
// 批处理（clear_done/clear_succeeded/retry_failed）。
//
// 列表查询的 regex 参数有两种语义：走索引表时作为名称子串
// （LIKE）过滤，走活任务路径时按正则匹配。两条路径共用同一个
// 入参是历史行为，调用方需要知道这一点。
//
// 鉴权规则：非管理员只能看见/操作自己创建的任务；对不存在与
// 无权访问统一返回 404，避免通过错误信息探测有效任务 ID。

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde::Deserialize;

use crate::persistence::{TaskDb, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::task::{PersistableTask, TaskManager, TaskState, TaskView};

use super::super::error::{ApiError, ApiResponse, ApiResult};
use super::super::user::CurrentUser;

/// 分页响应
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct PageResp<T> {
    pub content: Vec<T>,
    pub total: i64,
}

/// 每类任务路由的共享状态
pub struct KindState<T: PersistableTask> {
    pub manager: Arc<TaskManager<T>>,
    pub db: Option<Arc<TaskDb>>,
    pub kind: &'static str,
    pub use_index: bool,
}

impl<T: PersistableTask> Clone for KindState<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            db: self.db.clone(),
            kind: self.kind,
            use_index: self.use_index,
        }
    }
}

/// 组装一类任务的全部路由
pub fn task_routes<T: PersistableTask>(state: KindState<T>) -> Router {
    Router::new()
        .route("/undone", get(list_undone::<T>))
        .route("/done", get(list_done::<T>))
        .route("/info", post(task_info::<T>))
        .route("/cancel", post(cancel_task::<T>))
        .route("/delete", post(delete_task::<T>))
        .route("/retry", post(retry_task::<T>))
        .route("/cancel_some", post(cancel_some::<T>))
        .route("/delete_some", post(delete_some::<T>))
        .route("/retry_some", post(retry_some::<T>))
        .route("/clear_done", post(clear_done::<T>))
        .route("/clear_succeeded", post(clear_succeeded::<T>))
        .route("/retry_failed", post(retry_failed::<T>))
        .with_state(state)
}

// ============================================================================
// 列表查询
// ============================================================================

/// 原始查询参数（宽松解析，非法值回落默认）
#[derive(Debug, Default, Deserialize)]
pub struct RawListQuery {
    page: Option<String>,
    page_size: Option<String>,
    order_by: Option<String>,
    order: Option<String>,
    mine: Option<String>,
    regex: Option<String>,
}

/// 排序字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Name,
    Creator,
    State,
    Progress,
}

/// 解析后的列表查询
pub struct ListQuery {
    pub page: usize,
    pub page_size: usize,
    pub order_by: OrderBy,
    pub reverse: bool,
    pub mine: bool,
    pub regex: Option<Regex>,
    /// regex 的原始值，索引路径当作 LIKE 子串
    pub keyword: String,
}

/// 查询参数解析与边界收敛
pub fn parse_list_query(raw: RawListQuery) -> ApiResult<ListQuery> {
    let page = raw
        .page
        .and_then(|p| p.parse::<i64>().ok())
        .filter(|p| *p >= 1)
        .unwrap_or(1) as usize;
    let page_size = raw
        .page_size
        .and_then(|p| p.parse::<i64>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE as i64)
        .min(MAX_PAGE_SIZE as i64) as usize;

    let order_by = match raw
        .order_by
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "creator" => OrderBy::Creator,
        "state" => OrderBy::State,
        "progress" => OrderBy::Progress,
        _ => OrderBy::Name,
    };
    let order = raw.order.unwrap_or_default().to_ascii_lowercase();
    let reverse = order == "desc" || order == "true";
    let mine = raw
        .mine
        .and_then(|m| m.parse::<bool>().ok())
        .unwrap_or(false);

    let keyword = raw.regex.unwrap_or_default();
    let regex = if keyword.is_empty() {
        None
    } else {
        Some(Regex::new(&keyword).map_err(|e| ApiError::bad_request(e.to_string()))?)
    };

    Ok(ListQuery {
        page,
        page_size,
        order_by,
        reverse,
        mine,
        regex,
        keyword,
    })
}

/// 活任务视图排序
///
/// 字符串按字节序；progress 先按数值倒序再受 order 反转；
/// 同值以任务 ID 决胜。
pub fn sort_views(views: &mut [TaskView], order_by: OrderBy, reverse: bool) {
    views.sort_by(|a, b| {
        let mut ord = match order_by {
            OrderBy::Name => a.name.cmp(&b.name),
            OrderBy::Creator => a.creator.cmp(&b.creator),
            OrderBy::State => i32::from(a.state).cmp(&i32::from(b.state)),
            OrderBy::Progress => b
                .progress
                .partial_cmp(&a.progress)
                .unwrap_or(std::cmp::Ordering::Equal),
        };
        if ord == std::cmp::Ordering::Equal {
            ord = a.id.cmp(&b.id);
        }
        if reverse {
            ord.reverse()
        } else {
            ord
        }
    });
}

async fn list_tasks<T: PersistableTask>(
    state: &KindState<T>,
    user: &CurrentUser,
    raw: RawListQuery,
    states: &'static [TaskState],
) -> ApiResult<Json<ApiResponse<PageResp<TaskView>>>> {
    let query = parse_list_query(raw)?;
    let restrict_owner = query.mine || !user.is_admin();

    // 索引路径：无正则时直接查索引表
    if state.use_index && query.regex.is_none() {
        if let Some(db) = &state.db {
            let db = db.clone();
            let kind = state.kind;
            let creator_id = if restrict_owner { user.id } else { 0 };
            let keyword = query.keyword.clone();
            let (page, page_size) = (query.page, query.page_size);
            let (rows, total) = tokio::task::spawn_blocking(move || {
                db.list_task_records(kind, states, creator_id, &keyword, page, page_size)
            })
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?
            .map_err(|e| ApiError::internal(e.to_string()))?;
            return Ok(ApiResponse::success(PageResp {
                content: rows.into_iter().map(TaskView::from).collect(),
                total,
            }));
        }
    }

    // 活任务路径：内存过滤 + 排序 + 分页
    let tasks = state.manager.get_by_condition(|t| {
        let base = t.base();
        if !states.contains(&base.state()) {
            return false;
        }
        let creator_id = base.creator().map(|c| c.id).unwrap_or(0);
        if !user.is_admin() && creator_id != user.id {
            return false;
        }
        if restrict_owner && creator_id != user.id {
            return false;
        }
        if let Some(re) = &query.regex {
            if !re.is_match(&t.name()) {
                return false;
            }
        }
        true
    });
    let mut views: Vec<TaskView> = tasks.iter().map(|t| TaskView::of(t.as_ref())).collect();
    sort_views(&mut views, query.order_by, query.reverse);

    let total = views.len() as i64;
    let start = ((query.page - 1) * query.page_size).min(views.len());
    let end = (start + query.page_size).min(views.len());
    Ok(ApiResponse::success(PageResp {
        content: views[start..end].to_vec(),
        total,
    }))
}

async fn list_undone<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Query(raw): Query<RawListQuery>,
) -> ApiResult<Json<ApiResponse<PageResp<TaskView>>>> {
    list_tasks(&state, &user, raw, TaskState::undone()).await
}

async fn list_done<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Query(raw): Query<RawListQuery>,
) -> ApiResult<Json<ApiResponse<PageResp<TaskView>>>> {
    list_tasks(&state, &user, raw, TaskState::done()).await
}

// ============================================================================
// 单个操作
// ============================================================================

#[derive(Debug, Deserialize)]
struct TidQuery {
    tid: Option<String>,
}

/// 按 tid 找任务并做属主检查
///
/// 不存在与无权访问都返回 404 "task not found"。
fn find_authorized<T: PersistableTask>(
    state: &KindState<T>,
    user: &CurrentUser,
    tid: &str,
) -> ApiResult<Arc<T>> {
    let task = state
        .manager
        .get_by_id(tid)
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    let creator_id = task.base().creator().map(|c| c.id).unwrap_or(0);
    if !user.is_admin() && creator_id != user.id {
        return Err(ApiError::not_found("task not found"));
    }
    Ok(task)
}

async fn task_info<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Query(q): Query<TidQuery>,
) -> ApiResult<Json<ApiResponse<TaskView>>> {
    let task = find_authorized(&state, &user, q.tid.as_deref().unwrap_or(""))?;
    Ok(ApiResponse::success(TaskView::of(task.as_ref())))
}

async fn cancel_task<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Query(q): Query<TidQuery>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let task = find_authorized(&state, &user, q.tid.as_deref().unwrap_or(""))?;
    state.manager.cancel(&task.base().id()).await;
    Ok(ApiResponse::ok())
}

async fn delete_task<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Query(q): Query<TidQuery>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let task = find_authorized(&state, &user, q.tid.as_deref().unwrap_or(""))?;
    state.manager.remove(&task.base().id()).await;
    Ok(ApiResponse::ok())
}

async fn retry_task<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Query(q): Query<TidQuery>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let task = find_authorized(&state, &user, q.tid.as_deref().unwrap_or(""))?;
    state.manager.retry(&task.base().id()).await;
    Ok(ApiResponse::ok())
}

// ============================================================================
// 批量操作
// ============================================================================

/// 批量操作骨架：对每个 ID 做属主检查后执行操作，
/// 失败的 ID 收进 `id -> 错误` 映射返回。
async fn batch_op<T, F, Fut>(
    state: &KindState<T>,
    user: &CurrentUser,
    tids: Vec<String>,
    op: F,
) -> Json<ApiResponse<HashMap<String, String>>>
where
    T: PersistableTask,
    F: Fn(Arc<TaskManager<T>>, String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut errs = HashMap::new();
    for tid in tids {
        match find_authorized(state, user, &tid) {
            Ok(task) => op(state.manager.clone(), task.base().id()).await,
            Err(_) => {
                errs.insert(tid, "task not found".to_string());
            }
        }
    }
    ApiResponse::success(errs)
}

async fn cancel_some<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Json(tids): Json<Vec<String>>,
) -> Json<ApiResponse<HashMap<String, String>>> {
    batch_op(&state, &user, tids, |m, id| async move { m.cancel(&id).await }).await
}

async fn delete_some<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Json(tids): Json<Vec<String>>,
) -> Json<ApiResponse<HashMap<String, String>>> {
    batch_op(&state, &user, tids, |m, id| async move { m.remove(&id).await }).await
}

async fn retry_some<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
    Json(tids): Json<Vec<String>>,
) -> Json<ApiResponse<HashMap<String, String>>> {
    batch_op(&state, &user, tids, |m, id| async move { m.retry(&id).await }).await
}

// ============================================================================
// 批处理
// ============================================================================

fn owned_by<T: PersistableTask>(task: &T, user: &CurrentUser) -> bool {
    let creator_id = task.base().creator().map(|c| c.id).unwrap_or(0);
    user.is_admin() || creator_id == user.id
}

async fn clear_done<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
) -> Json<ApiResponse<()>> {
    state
        .manager
        .remove_by_condition(|t| owned_by(t, &user) && t.base().state().is_terminal())
        .await;
    ApiResponse::ok()
}

async fn clear_succeeded<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
) -> Json<ApiResponse<()>> {
    state
        .manager
        .remove_by_condition(|t| owned_by(t, &user) && t.base().state() == TaskState::Succeeded)
        .await;
    ApiResponse::ok()
}

async fn retry_failed<T: PersistableTask>(
    State(state): State<KindState<T>>,
    user: CurrentUser,
) -> Json<ApiResponse<()>> {
    let failed = state
        .manager
        .get_by_condition(|t| owned_by(t, &user) && t.base().state() == TaskState::Failed);
    for task in failed {
        state.manager.retry(&task.base().id()).await;
    }
    ApiResponse::ok()
}
