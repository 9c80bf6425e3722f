use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced across the HTTP boundary and cluster logic.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] kv::Error),

    #[error("not found")]
    NotFound,

    #[error("no leader available")]
    NoLeaderAvailable,

    #[error("leader unreachable: {0}")]
    LeaderUnreachable(#[from] reqwest::Error),
}

pub type CResult<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::NoLeaderAvailable | Error::LeaderUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(kv::Error::Value(_)) => StatusCode::BAD_REQUEST,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}
