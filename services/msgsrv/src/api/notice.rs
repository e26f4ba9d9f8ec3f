//! Notices: persisted in `sys_notice`, pushed by the background worker

use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use tracing::info;

use common::{success_response, ApiResponse, PageInfo, PageQuery};
use errors::{HeraldError, HeraldResult};

use super::ApiResult;
use crate::app_state::AppState;
use crate::tx_scope::RequestContext;
use crate::worker::{Job, NoticeDelivery, NoticeMessage, NoticeTarget};

pub const TARGET_ALL: i64 = 1;
pub const TARGET_SPECIFIED: i64 = 2;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoticeRequest {
    pub title: String,
    pub content: String,
    pub target_type: i64,
    #[serde(default)]
    pub target_users: Vec<String>,
}

impl CreateNoticeRequest {
    fn target(&self) -> HeraldResult<NoticeTarget> {
        if self.title.trim().is_empty() {
            return Err(HeraldError::Validation("title must not be empty".to_string()));
        }
        match self.target_type {
            TARGET_ALL => Ok(NoticeTarget::All),
            TARGET_SPECIFIED => {
                let users: Vec<String> = self
                    .target_users
                    .iter()
                    .map(|u| u.trim())
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect();
                if users.is_empty() {
                    return Err(HeraldError::Validation(
                        "targetUsers is required when targetType is 2".to_string(),
                    ));
                }
                Ok(NoticeTarget::Users(users))
            },
            other => Err(HeraldError::Validation(format!(
                "unknown targetType {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct NoticeRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub target_type: i64,
    /// Comma separated usernames
    pub target_users: Option<String>,
    pub publisher: String,
    pub publish_time: i64,
}

/// `POST /api/v1/notices`
pub async fn create_notice(
    State(state): State<AppState>,
    ctx: RequestContext,
    axum::Json(req): axum::Json<CreateNoticeRequest>,
) -> ApiResult<i64> {
    let publisher = ctx.require_principal()?.username.clone();
    let target = req.target()?;
    let publish_time = state.clock.now_millis();

    let target_users = match &target {
        NoticeTarget::All => None,
        NoticeTarget::Users(users) => Some(users.join(",")),
    };
    let (title, content, target_type, who) = (
        req.title.clone(),
        req.content.clone(),
        req.target_type,
        publisher.clone(),
    );
    let id = ctx
        .with_conn(|conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    "INSERT INTO sys_notice \
                     (title, content, target_type, target_users, publisher, publish_time) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(title)
                .bind(content)
                .bind(target_type)
                .bind(target_users)
                .bind(who)
                .bind(publish_time)
                .execute(&mut *conn)
                .await?;
                Ok::<_, HeraldError>(result.last_insert_rowid())
            })
        })
        .await?;

    info!(notice_id = id, %publisher, "Notice published");
    state.worker.submit(Job::DeliverNotice(NoticeDelivery {
        notice: NoticeMessage {
            id,
            title: req.title,
            content: req.content,
            publisher,
            publish_time,
        },
        target,
    }));

    Ok(success_response(id))
}

/// `GET /api/v1/notices?pageNum&pageSize`
pub async fn list_notices(
    ctx: RequestContext,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<NoticeRecord>> {
    let (limit, offset) = page.limit_offset();
    let (total, records) = ctx
        .with_conn(|conn| {
            Box::pin(async move {
                let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sys_notice")
                    .fetch_one(&mut *conn)
                    .await?;
                let records = sqlx::query_as::<_, NoticeRecord>(
                    "SELECT id, title, content, target_type, target_users, publisher, publish_time \
                     FROM sys_notice ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&mut *conn)
                .await?;
                Ok::<_, HeraldError>((total, records))
            })
        })
        .await?;

    let info = PageInfo {
        total: u64::try_from(total).unwrap_or_default(),
        page_num: page.page_num.max(1),
        page_size: u32::try_from(limit).unwrap_or(page.page_size),
    };
    Ok(axum::Json(ApiResponse::ok_page(records, info)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn request(target_type: i64, users: &[&str]) -> CreateNoticeRequest {
        CreateNoticeRequest {
            title: "t".into(),
            content: "c".into(),
            target_type,
            target_users: users.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_target_resolution() {
        assert_eq!(request(1, &[]).target().unwrap(), NoticeTarget::All);
        assert_eq!(
            request(2, &["alice", " ", "bob "]).target().unwrap(),
            NoticeTarget::Users(vec!["alice".into(), "bob".into()])
        );
        assert!(request(2, &[]).target().is_err());
        assert!(request(3, &[]).target().is_err());
    }
}
