//! Control-plane response envelope.
//!
//! Every handler answers `{success, data?, message?, error?}`; errors
//! carry a closed code and a human-readable message, never internal
//! stack detail.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::error::{EngineError, ErrorCode};

/// Successful response with a payload.
pub fn api_ok<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// Successful response with just a message.
pub fn api_message(message: &str) -> Response {
    Json(json!({ "success": true, "message": message })).into_response()
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::DeviceNotFound | ErrorCode::SessionNotFound | ErrorCode::FileNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::RecordingInProgress | ErrorCode::DeviceBusy => StatusCode::CONFLICT,
        ErrorCode::InvalidParameters | ErrorCode::InvalidFormat | ErrorCode::InvalidSettings => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::ConnectionTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::InsufficientSpace => StatusCode::INSUFFICIENT_STORAGE,
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::BluetoothError
        | ErrorCode::ConnectionFailed
        | ErrorCode::ExportFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = Json(json!({
            "success": false,
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
            }
        }));
        (status_for(code), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let response = EngineError::SessionNotFound {
            session_id: "x".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_already_recording_maps_to_409() {
        let response = EngineError::AlreadyRecording.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_insufficient_space_maps_to_507() {
        let response = EngineError::InsufficientSpace {
            available_mb: 1,
            required_mb: 512,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    }
}
