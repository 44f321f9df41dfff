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

use serde::{Deserialize, Serialize};

use crate::utils::json;

/// the query request envelope accepted on /v1/query
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub request_id: String,
    pub tenant: String,
    #[serde(default)]
    pub api_key: String,
    pub dialect: String,
    pub query: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub partial_results: bool,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub cache_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            timeout_ms: 0,
            partial_results: true,
            cache: true,
            cache_ttl_secs: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Partial,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub data: Vec<json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDetail>,
    pub metrics: ResponseMetrics,
}

/// user visible error, internal details never leak through this
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<json::Value>,
}

impl ErrorDetail {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        ErrorDetail {
            code: code.to_string(),
            message: message.into(),
            field: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub took_ms: u64,
    pub sub_plans: usize,
    pub partitions_scanned: usize,
    pub partitions_pruned: usize,
    pub rows_returned: usize,
    pub cache_hit: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: json::Map<String, json::Value>,
    pub timestamp: i64,
}

/// one record pushed through /v1/ingest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub tenant: String,
    pub timestamp: json::Value,
    pub payload: json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<super::record::GeoPoint>,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub id: String,
    /// primary partition assigned by the active time strategy
    pub partition: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_defaults() {
        let req: QueryRequest = json::from_str(
            r#"{"tenant":"default","dialect":"sql","query":"SELECT 1"}"#,
        )
        .unwrap();
        assert!(req.options.partial_results);
        assert!(req.options.cache);
        assert_eq!(req.options.timeout_ms, 0);
    }
}
