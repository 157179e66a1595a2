use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{debug, error};

use crate::{
    auth::{CurrentUser, Role},
    error::{AppError, TripError},
    models::trip::{NewTrip, Trip, TripStatus},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_trip))
        .route("/:id", get(trip_detail))
        .route("/:id/claim", post(claim_trip))
        .route("/:id/transition", post(transition_trip))
        .route("/:id/rating", post(rate_trip))
}

async fn create_trip(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(new): Json<NewTrip>,
) -> Result<(StatusCode, Json<Trip>), AppError> {
    let user = current.require_client()?;
    let trip = state.lifecycle.create(&user.id, new).await?;
    Ok((StatusCode::CREATED, Json(trip)))
}

async fn trip_detail(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let trip = state.lifecycle.fetch(&trip_id).await?;
    let visible = trip.is_party(current.id())
        || (trip.status == TripStatus::Pending && current.0.role == Role::Driver);
    if !visible {
        return Err(TripError::NotAParty.into());
    }
    Ok(Json(trip))
}

async fn claim_trip(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let driver = current.require_driver()?;
    let result = state.dispatch.claim(&trip_id, &driver.id).await;
    resolve(&state, &trip_id, result).await
}

#[derive(Deserialize)]
struct TransitionForm {
    to: TripStatus,
    #[serde(default)]
    expected: Option<TripStatus>,
}

async fn transition_trip(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<String>,
    Json(form): Json<TransitionForm>,
) -> Result<Json<Trip>, AppError> {
    let result = match form.expected {
        Some(expected) => {
            state
                .lifecycle
                .transition_from(&trip_id, current.id(), expected, form.to)
                .await
        }
        None => {
            state
                .lifecycle
                .transition(&trip_id, current.id(), form.to)
                .await
        }
    };
    resolve(&state, &trip_id, result).await
}

#[derive(Deserialize)]
struct RatingForm {
    rating: i64,
    #[serde(default)]
    comment: Option<String>,
}

async fn rate_trip(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<String>,
    Json(form): Json<RatingForm>,
) -> Result<Json<Trip>, AppError> {
    let user = current.require_client()?;
    let result = state
        .lifecycle
        .rate(&trip_id, &user.id, form.rating, form.comment)
        .await;
    resolve(&state, &trip_id, result).await
}

/// A replayed request answers with the trip as it stands; other outcomes map
/// to their status codes.
async fn resolve(
    state: &AppState,
    trip_id: &str,
    result: Result<Trip, TripError>,
) -> Result<Json<Trip>, AppError> {
    match result {
        Ok(trip) => Ok(Json(trip)),
        Err(TripError::AlreadyApplied) => {
            debug!(trip_id, "request already applied");
            Ok(Json(state.lifecycle.fetch(trip_id).await?))
        }
        Err(err) if err.is_outcome() => {
            debug!(trip_id, outcome = err.code(), "request refused");
            Err(err.into())
        }
        Err(err) => {
            error!(trip_id, error = %err, "trip store failure");
            Err(err.into())
        }
    }
}
