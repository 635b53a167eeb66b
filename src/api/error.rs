use crate::error::CopilotError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Copilot(#[from] CopilotError),

    #[error("Missing or empty X-User-Id header")]
    Unauthenticated,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let ApiError::Copilot(error) = self else {
            return StatusCode::UNAUTHORIZED;
        };
        match error {
            CopilotError::AlreadyStreaming(_)
            | CopilotError::NoActiveStream(_)
            | CopilotError::InvalidTransition(_) => StatusCode::CONFLICT,
            CopilotError::PermissionDenied(_) | CopilotError::Forbidden(_) => StatusCode::FORBIDDEN,
            CopilotError::SyntaxRejected(_) | CopilotError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            CopilotError::NotFound(_) => StatusCode::NOT_FOUND,
            CopilotError::PoolExhausted(_) | CopilotError::AiServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CopilotError::EngineTimeout(_) | CopilotError::AiTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            CopilotError::ConnectFailed(_) => StatusCode::BAD_GATEWAY,
            CopilotError::EngineError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CopilotError::Cancelled(_) | CopilotError::Config(_) | CopilotError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Copilot(error) => error.code(),
            ApiError::Unauthenticated => "unauthenticated",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.code(), "Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CopilotError::AlreadyStreaming("c".into()), StatusCode::CONFLICT),
            (CopilotError::NoActiveStream("c".into()), StatusCode::CONFLICT),
            (CopilotError::permission_denied("x"), StatusCode::FORBIDDEN),
            (CopilotError::syntax("x"), StatusCode::BAD_REQUEST),
            (CopilotError::not_found("x"), StatusCode::NOT_FOUND),
            (CopilotError::pool_exhausted("x"), StatusCode::SERVICE_UNAVAILABLE),
            (CopilotError::engine_timeout("x"), StatusCode::GATEWAY_TIMEOUT),
            (CopilotError::connect_failed("x"), StatusCode::BAD_GATEWAY),
            (CopilotError::engine("x"), StatusCode::UNPROCESSABLE_ENTITY),
            (CopilotError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_details_hidden() {
        let response = ApiError::from(CopilotError::internal("lock poisoned at store.rs:42"))
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
