use axum::{Json, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde_json::json;

/// The envelope every non-SSE HTTP error response carries: `success:false`
/// plus a machine-readable code, a human message, and a UTC timestamp.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
}

impl ApiError {
    pub const fn new(status: StatusCode, code: &'static str, message: &'static str) -> Self {
        Self { status, code, message }
    }

    pub const fn auth_token_invalid() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "AUTH_TOKEN_INVALID", "missing or invalid authentication token")
    }

    pub const fn streaming_unsupported() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STREAMING_UNSUPPORTED", "response does not support streaming")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
                "details": {},
            },
            "timestamp": Utc::now().to_rfc3339(),
        }));

        (self.status, body).into_response()
    }
}
