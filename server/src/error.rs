//! Error types for buggyd.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("authentication credentials were not provided")]
    MissingCredential,

    #[error("invalid token")]
    InvalidCredential,

    #[error("token has expired")]
    ExpiredCredential,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for TrackError {
    fn into_response(self) -> Response {
        let status = match &self {
            TrackError::MissingCredential
            | TrackError::InvalidCredential
            | TrackError::ExpiredCredential => StatusCode::UNAUTHORIZED,
            TrackError::Forbidden(_) => StatusCode::FORBIDDEN,
            TrackError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TrackError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
