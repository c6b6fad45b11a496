//! HTTP-level failures and the status codes they map to.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

/// A request that is answered without a regular JSON body.
///
/// Statement errors are not here: those are reported with status 200 and an
/// `error` field in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Malformed request body or parameters.
    BadRequest(String),

    /// This node is not the leader; the client should retry at the URL.
    Redirect(String),

    /// No leader is known, so the request cannot be served anywhere yet.
    Unavailable(String),

    /// The store failed to carry out a well-formed request.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Redirect(_) => StatusCode::MOVED_PERMANENTLY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Redirect(location) => {
                (status, [(header::LOCATION, location)]).into_response()
            }
            ApiError::BadRequest(msg) | ApiError::Unavailable(msg) | ApiError::Internal(msg) => {
                (status, msg).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_sets_location() {
        let response = ApiError::Redirect("http://leader:9301/db/execute".into()).into_response();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "http://leader:9301/db/execute"
        );
    }

    #[test]
    fn statuses() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
