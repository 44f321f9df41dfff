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

use std::time::Instant;

use axum::Json;
use config::{
    ider,
    meta::search::{QueryRequest, QueryResponse},
    metrics,
};

use super::{ApiError, ApiResult};
use crate::{handler::http::auth::validator, service};

/// POST /v1/query
pub async fn search(Json(mut request): Json<QueryRequest>) -> ApiResult<Json<QueryResponse>> {
    let started = Instant::now();
    if request.request_id.is_empty() {
        request.request_id = ider::generate();
    }
    let resource = format!("query:{}", primary_table(&request));
    validator::validate(&request.tenant, &request.api_key, &resource)
        .map_err(ApiError)?;

    let response = service::query::search(&request).await.map_err(ApiError)?;
    metrics::HTTP_INCOMING_REQUESTS
        .with_label_values(&["/v1/query", "200", &request.tenant])
        .inc();
    metrics::HTTP_RESPONSE_TIME
        .with_label_values(&["/v1/query", "200", &request.tenant])
        .observe(started.elapsed().as_secs_f64());
    Ok(Json(response))
}

/// best-effort table name for the policy resource; the parser gives the
/// authoritative answer later
fn primary_table(request: &QueryRequest) -> String {
    let query = request.query.trim();
    if let Some(rest) = query.strip_prefix("db.") {
        return rest.split('.').next().unwrap_or("unknown").to_string();
    }
    let upper = query.to_uppercase();
    if let Some(idx) = upper.find(" FROM ") {
        return query[idx + 6..]
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string();
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_table_extraction() {
        let mut request = QueryRequest {
            request_id: String::new(),
            tenant: "t".to_string(),
            api_key: String::new(),
            dialect: "sql".to_string(),
            query: "SELECT * FROM events WHERE a = 1".to_string(),
            options: Default::default(),
        };
        assert_eq!(primary_table(&request), "events");
        request.query = "db.places.find({})".to_string();
        assert_eq!(primary_table(&request), "places");
        request.query = "nonsense".to_string();
        assert_eq!(primary_table(&request), "unknown");
    }
}
