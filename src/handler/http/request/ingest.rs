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

use axum::{Json, http::HeaderMap, http::StatusCode};
use config::meta::search::{IngestRequest, IngestResponse};

use super::{ApiError, ApiResult};
use crate::{handler::http::auth::validator, service};

/// POST /v1/ingest
pub async fn ingest(
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let stream = request
        .tags
        .get(service::db::STREAM_TAG)
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    validator::validate(&request.tenant, api_key, &format!("ingest:{stream}"))
        .map_err(ApiError)?;

    let response = service::ingest::ingest(request).await.map_err(ApiError)?;
    Ok((StatusCode::CREATED, Json(response)))
}
