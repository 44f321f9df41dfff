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

use config::{
    meta::record::GeoPoint,
    meta::search::{QueryOptions, QueryRequest, ResponseStatus},
    utils::json,
};
use datapunk::service::{self, db, federation, ingest, partition, query};

fn init_all() {
    let _ = partition::init();
    federation::sources::init();
    query::parser::init();
}

async fn push(
    tenant: &str,
    stream: &str,
    ts: &str,
    payload: json::Value,
    geo: Option<GeoPoint>,
) -> String {
    let response = ingest::ingest(config::meta::search::IngestRequest {
        tenant: tenant.to_string(),
        timestamp: json::json!(ts),
        payload,
        geo,
        tags: std::collections::HashMap::from([(
            db::STREAM_TAG.to_string(),
            stream.to_string(),
        )]),
    })
    .await
    .expect("ingest succeeds");
    response.partition
}

fn sql_request(tenant: &str, query: &str) -> QueryRequest {
    QueryRequest {
        request_id: String::new(),
        tenant: tenant.to_string(),
        api_key: String::new(),
        dialect: "sql".to_string(),
        query: query.to_string(),
        options: QueryOptions {
            cache: false,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn test_sql_time_filter_prunes_and_groups() {
    init_all();
    let tenant = "e2e_sql";
    // three january events for two users plus one february straggler
    push(tenant, "events", "2024-01-05T10:00:00Z", json::json!({"user_id": "u1"}), None).await;
    push(tenant, "events", "2024-01-07T11:00:00Z", json::json!({"user_id": "u1"}), None).await;
    push(tenant, "events", "2024-01-20T12:00:00Z", json::json!({"user_id": "u2"}), None).await;
    push(tenant, "events", "2024-02-02T09:00:00Z", json::json!({"user_id": "u3"}), None).await;

    let response = query::search(&sql_request(
        tenant,
        "SELECT user_id, COUNT(*) AS cnt FROM events \
         WHERE ts >= '2024-01-01T00:00:00Z' AND ts < '2024-02-01' \
         GROUP BY user_id LIMIT 10",
    ))
    .await
    .unwrap();

    assert_eq!(response.status, ResponseStatus::Ok);
    // the optimizer pruned january down to its 31 day partitions
    assert_eq!(response.metrics.partitions_scanned, 31);
    assert_eq!(response.data.len(), 2);
    let u1 = response
        .data
        .iter()
        .find(|r| r["user_id"] == "u1")
        .expect("u1 present");
    assert_eq!(u1["cnt"], 2);
    assert!(!response.data.iter().any(|r| r["user_id"] == "u3"));
}

#[tokio::test]
async fn test_nosql_geo_query_ranked_by_distance() {
    init_all();
    let tenant = "e2e_geo";
    // two places inside the radius, one across the ocean
    push(
        tenant,
        "places",
        "2024-01-01T00:00:00Z",
        json::json!({"name": "close"}),
        Some(GeoPoint::new(40.7130, -74.0058)),
    )
    .await;
    push(
        tenant,
        "places",
        "2024-01-01T00:01:00Z",
        json::json!({"name": "closest"}),
        Some(GeoPoint::new(40.7128, -74.0060)),
    )
    .await;
    push(
        tenant,
        "places",
        "2024-01-01T00:02:00Z",
        json::json!({"name": "london"}),
        Some(GeoPoint::new(51.5074, -0.1278)),
    )
    .await;

    let mut request = sql_request(
        tenant,
        r#"db.places.find({loc: {$near: {point: [40.7128, -74.0060], maxDistance: 1000}}})"#,
    );
    request.dialect = "nosql".to_string();
    let response = query::search(&request).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.data.len(), 2);
    // ranked by distance from the query point
    assert_eq!(response.data[0]["name"], "closest");
    assert_eq!(response.data[1]["name"], "close");
}

#[tokio::test]
async fn test_federated_join_across_sources() {
    init_all();
    let tenant = "e2e_join";
    // a document source claims the profiles table; with no endpoint it
    // still executes locally, but the splitter sees two sources
    federation::sources::register(config::meta::source::DataSource {
        name: "profile_store".to_string(),
        kind: config::meta::source::SourceKind::Document,
        endpoint: String::new(),
        auth: config::meta::source::SourceAuth::None,
        capabilities: Default::default(),
        tables: vec!["profiles_e2e".to_string()],
        version: 0,
    });

    push(tenant, "users_e2e", "2024-03-01T00:00:00Z", json::json!({"user_id": "u1", "name": "ada"}), None).await;
    push(tenant, "users_e2e", "2024-03-01T00:01:00Z", json::json!({"user_id": "u2", "name": "lin"}), None).await;
    push(
        tenant,
        "profiles_e2e",
        "2024-03-01T00:02:00Z",
        json::json!({"user_id": "u1", "profile": {"bio": "hello"}}),
        None,
    )
    .await;

    let response = query::search(&sql_request(
        tenant,
        "SELECT u.user_id, u.name FROM users_e2e u \
         INNER JOIN profiles_e2e p ON u.user_id = p.user_id",
    ))
    .await
    .unwrap();

    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.metrics.sub_plans, 2);
    // |users ⋈ profiles| = 1
    assert_eq!(response.data.len(), 1);
    assert_eq!(response.data[0]["user_id"], "u1");
}

#[tokio::test]
async fn test_query_result_cache_hit() {
    init_all();
    let tenant = "e2e_cache";
    // a dedicated source isolates this test's cache keys from the other
    // tests' writes to the shared local source
    federation::sources::register(config::meta::source::DataSource {
        name: "cached_store".to_string(),
        kind: config::meta::source::SourceKind::Relational,
        endpoint: String::new(),
        auth: config::meta::source::SourceAuth::None,
        capabilities: Default::default(),
        tables: vec!["cached".to_string()],
        version: 0,
    });
    push(tenant, "cached", "2024-04-01T00:00:00Z", json::json!({"v": 1}), None).await;

    let mut request = sql_request(tenant, "SELECT v FROM cached LIMIT 5");
    request.options.cache = true;

    let first = query::search(&request).await.unwrap();
    assert!(!first.metrics.cache_hit);
    let second = query::search(&request).await.unwrap();
    assert!(second.metrics.cache_hit);
    assert_eq!(first.data, second.data);

    // a write bumps the source version, the fingerprint moves on
    push(tenant, "cached", "2024-04-01T00:05:00Z", json::json!({"v": 2}), None).await;
    let third = query::search(&request).await.unwrap();
    assert!(!third.metrics.cache_hit);
    assert_eq!(third.data.len(), 2);
}

#[tokio::test]
async fn test_rate_limit_envelope() {
    init_all();
    service::ratelimit::set_rule(config::meta::ratelimit::RateLimitRule {
        tenant: "e2e_rl".to_string(),
        resource: "query".to_string(),
        requests_per_second: 10.0,
        burst_size: 20.0,
    });
    let mut allowed = 0;
    let mut limited = 0;
    for _ in 0..25 {
        let decision = service::ratelimit::try_consume("e2e_rl", "query", 1.0);
        if decision.allowed {
            allowed += 1;
        } else {
            limited += 1;
            assert!(decision.retry_after_secs >= 0.1);
            assert!(decision.retry_after_secs <= 1.0);
        }
    }
    assert_eq!(allowed, 20);
    assert_eq!(limited, 5);
}

#[tokio::test]
async fn test_partial_results_disabled_fails_whole_query() {
    init_all();
    let tenant = "e2e_partial";
    // a source with an unreachable endpoint owns one side of the union
    federation::sources::register(config::meta::source::DataSource {
        name: "dead_source".to_string(),
        kind: config::meta::source::SourceKind::Relational,
        endpoint: "http://127.0.0.1:1".to_string(),
        auth: config::meta::source::SourceAuth::None,
        capabilities: Default::default(),
        tables: vec!["dead_table".to_string()],
        version: 0,
    });
    push(tenant, "live_table", "2024-05-01T00:00:00Z", json::json!({"user_id": "u1"}), None).await;

    let mut request = sql_request(
        tenant,
        "SELECT l.user_id FROM live_table l \
         INNER JOIN dead_table d ON l.user_id = d.user_id",
    );
    request.options.partial_results = false;
    let response = query::search(&request).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Failed);
    assert!(!response.errors.is_empty());
    assert!(response.data.is_empty());

    request.options.partial_results = true;
    let response = query::search(&request).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Partial);
}

#[tokio::test]
async fn test_single_flight_identical_queries() {
    init_all();
    let tenant = "e2e_flight";
    push(tenant, "flight", "2024-06-01T00:00:00Z", json::json!({"v": 42}), None).await;

    let mut request = sql_request(tenant, "SELECT v FROM flight LIMIT 1");
    request.options.cache = true;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            query::search(&request).await.unwrap()
        }));
    }
    let mut first_rows: Option<Vec<json::Value>> = None;
    for handle in handles {
        let response = handle.await.unwrap();
        // all 100 callers see identical results
        match &first_rows {
            None => first_rows = Some(response.data),
            Some(expected) => assert_eq!(&response.data, expected),
        }
    }
}
