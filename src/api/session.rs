use axum::{extract::State, Json};

use crate::{error::Result, game::SessionSnapshot, models::ApiResponse};

use super::AppState;

/// GET /api/v1/session
pub async fn get_session(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<SessionSnapshot>>> {
    Ok(Json(ApiResponse::success(state.session.snapshot())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::app_state;

    #[tokio::test]
    async fn empty_session_before_first_snapshot() {
        let Json(response) = get_session(State(app_state())).await.unwrap();
        assert!(response.success);
        assert!(!response.data.joined);
        assert_eq!(response.data.round_id, None);
    }
}
