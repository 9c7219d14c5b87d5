// 请求身份
//
// 认证本身由外部网关完成，这里只消费请求扩展里的身份三元组。
// 缺失身份统一回 401。

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::task::{Creator, ROLE_ADMIN};

use super::error::ApiError;

/// 当前请求用户
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: u64,
    pub username: String,
    pub role: i32,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn creator(&self) -> Creator {
        Creator {
            id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}

#[async_trait::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("user invalid"))
    }
}

/// 从请求头取身份的注入中间件
///
/// 生产部署里由认证网关写入这些头；没有头的请求不带身份，
/// 在需要身份的接口处得到 401。
pub async fn inject_user(
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let headers = req.headers();
    let id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(id) = id {
        let username = headers
            .get("x-user-name")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let role = headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        req.extensions_mut().insert(CurrentUser { id, username, role });
    }
    next.run(req).await
}
