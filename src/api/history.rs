use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, Result},
    models::{ApiResponse, ChatEvent, RoundRecord, RoundTotals},
};

use super::{page_size, AppState};

#[derive(Debug, Deserialize)]
pub struct RoundsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RoundView {
    #[serde(flatten)]
    pub record: RoundRecord,
    pub totals: RoundTotals,
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub username: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// GET /api/v1/history/rounds
///
/// Buffered rounds, newest first.
pub async fn get_rounds(
    State(state): State<AppState>,
    Query(query): Query<RoundsQuery>,
) -> Result<Json<ApiResponse<Vec<RoundView>>>> {
    let limit = page_size(query.limit, state.config.game_history);
    let records = state.rounds.read().await.records();
    let rounds = records
        .into_iter()
        .rev()
        .take(limit)
        .map(|record| RoundView {
            totals: record.totals(),
            record,
        })
        .collect();
    Ok(Json(ApiResponse::success(rounds)))
}

/// GET /api/v1/history/chat?username=&since=
///
/// With `username`, only that identity's say-messages; oldest first.
pub async fn get_chat(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
) -> Result<Json<ApiResponse<Vec<ChatEvent>>>> {
    let limit = page_size(query.limit, state.config.chat_history);
    let since = query.since.unwrap_or(DateTime::<Utc>::MIN_UTC);

    let store = state.chat.read().await;
    let mut events = match query.username.as_deref().map(str::trim) {
        Some("") => {
            return Err(AppError::BadRequest("username must not be empty".to_string()))
        }
        Some(username) => store.messages_from(username, since),
        None => store
            .records()
            .into_iter()
            .filter(|event| event.created >= since)
            .collect(),
    };
    drop(store);

    if events.len() > limit {
        events.drain(..events.len() - limit);
    }
    Ok(Json(ApiResponse::success(events)))
}
