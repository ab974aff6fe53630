use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded, resets at {reset_at}")]
    RateLimitExceeded { reset_at: DateTime<Utc> },

    #[error("Question not found or closed")]
    QuestionNotFound,

    #[error("Already voted on this question")]
    DuplicateVote,

    #[error("Invalid voter identity")]
    InvalidIdentity,

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Request timed out")]
    Timeout,

    #[error("Storage temporarily unavailable: {0}")]
    TransientStorageError(#[source] StoreError),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AppError::QuestionNotFound => "question_not_found",
            AppError::DuplicateVote => "duplicate_vote",
            AppError::InvalidIdentity => "invalid_identity",
            AppError::MalformedPayload => "malformed_payload",
            AppError::Timeout => "timeout",
            AppError::TransientStorageError(_) => "transient_storage_error",
        }
    }

    /// Only storage hiccups are worth retrying, and only off the critical path.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientStorageError(_))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<DateTime<Utc>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::QuestionNotFound => StatusCode::NOT_FOUND,
            AppError::DuplicateVote => StatusCode::CONFLICT,
            AppError::InvalidIdentity => StatusCode::UNAUTHORIZED,
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::TransientStorageError(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        // Storage internals stay in the logs.
        let message = match &self {
            AppError::TransientStorageError(_) | AppError::Timeout => {
                "Something went wrong, please try again".to_string()
            }
            other => other.to_string(),
        };

        let reset_at = match &self {
            AppError::RateLimitExceeded { reset_at } => Some(*reset_at),
            _ => None,
        };

        let body = ErrorBody {
            success: false,
            error: self.kind(),
            message,
            reset_at,
        };

        let mut response = (status, Json(body)).into_response();

        if let Some(reset_at) = reset_at {
            let seconds = (reset_at - Utc::now()).num_seconds().max(0);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }

        response
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("vote already recorded for this voter and question")]
    Duplicate,

    #[error("rate budget exhausted until {reset_at}")]
    BudgetExhausted { reset_at: DateTime<Utc> },

    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Anything that stops the server from coming up or shutting down cleanly.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("storage setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("listener failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate => AppError::DuplicateVote,
            StoreError::BudgetExhausted { reset_at } => AppError::RateLimitExceeded { reset_at },
            other => AppError::TransientStorageError(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            AppError::from(StoreError::Duplicate),
            AppError::DuplicateVote
        ));
        assert!(matches!(
            AppError::from(StoreError::BudgetExhausted {
                reset_at: Utc::now()
            }),
            AppError::RateLimitExceeded { .. }
        ));

        let transient = AppError::from(StoreError::Unavailable("down".into()));
        assert!(transient.is_transient());
        assert_eq!(transient.kind(), "transient_storage_error");
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::DuplicateVote, StatusCode::CONFLICT),
            (AppError::QuestionNotFound, StatusCode::NOT_FOUND),
            (AppError::InvalidIdentity, StatusCode::UNAUTHORIZED),
            (AppError::MalformedPayload, StatusCode::BAD_REQUEST),
            (
                AppError::RateLimitExceeded {
                    reset_at: Utc::now() + chrono::Duration::hours(1),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = AppError::RateLimitExceeded {
            reset_at: Utc::now() + chrono::Duration::seconds(90),
        }
        .into_response();

        let retry_after = response.headers().get(RETRY_AFTER).unwrap();
        let seconds: i64 = retry_after.to_str().unwrap().parse().unwrap();
        assert!((88..=90).contains(&seconds));
    }
}
