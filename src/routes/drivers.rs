use axum::{extract::State, routing::get, Json, Router};

use crate::{auth::CurrentUser, error::AppError, models::trip::Trip, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me/claimable", get(claimable))
        .route("/me/active", get(active))
}

async fn claimable(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<Trip>>, AppError> {
    let driver = current.require_driver()?;
    let trips = state.dispatch.list_claimable(&driver.id).await?;
    Ok(Json(trips))
}

async fn active(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<Trip>>, AppError> {
    let driver = current.require_driver()?;
    let trips = state.store.active_for_driver(&driver.id).await?;
    Ok(Json(trips))
}
