// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Maps domain errors onto HTTP responses.
//!
//! Every non-2xx response carries `{"error":{"code","message","details"?}}`
//! with the status taken from the error kind.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use treq_api::ErrorBody;
use treq_core::Error;

/// Newtype so `treq_core::Error` can implement `IntoResponse` here.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), message = %self.0.message(), "Request failed");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// Result alias for axum handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unwraps a JSON extractor result, turning body rejections into
/// `VALIDATION_ERROR` instead of axum's plain-text 4xx responses.
pub fn bind_json<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError(Error::validation(rejection.body_text()))),
    }
}
