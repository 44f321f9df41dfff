// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

pub mod cluster;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod query;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use config::{meta::search::ErrorDetail, utils::json};
use infra::errors::{Error, ErrorCodes};

/// error body per the API contract: {code, message, field?, details?};
/// internals never leak
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match &self.0 {
            Error::ErrorCode(code) => ErrorDetail {
                code: code.get_code().to_string(),
                message: code.get_message(),
                field: None,
                details: match code {
                    ErrorCodes::RateLimited(inner) => Some(json::json!({"retry": inner})),
                    _ => None,
                },
            },
            other => {
                log::error!("[HTTP] internal error: {other}");
                ErrorDetail::new("10001", "Server Internal Error")
            }
        };
        (status, axum::Json(detail)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
