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

//! Ingest: the stream container pushes records here. Each record lands in
//! every active strategy, the write fans out to replicas, and the ack names
//! the assigned primary partition.

use config::{
    ider,
    meta::{
        record::{PayloadType, Record},
        search::{IngestRequest, IngestResponse},
    },
    utils::{json, time::parse_timestamp_micro_from_value},
};
use infra::errors::*;

use super::{cluster::replication, db, federation::sources};

pub async fn ingest(request: IngestRequest) -> Result<IngestResponse> {
    if request.tenant.is_empty() {
        return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(
            "tenant is required".to_string(),
        )));
    }
    let timestamp = parse_timestamp_micro_from_value(&request.timestamp)
        .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))?;

    let mut tags = request.tags;
    tags.entry(db::STREAM_TAG.to_string())
        .or_insert_with(|| "default".to_string());

    let record = Record {
        id: ider::generate(),
        tenant: request.tenant,
        timestamp,
        geo: request.geo,
        payload: json::to_vec(&request.payload)?,
        payload_type: PayloadType::Json,
        tags,
    };

    let record_id = record.id.clone();
    let keys = db::write_record(record.clone())?;
    let primary = keys
        .iter()
        .find(|k| matches!(k, config::meta::partition::PartitionKey::Time { .. }))
        .or_else(|| keys.first())
        .expect("write_record returns at least one key")
        .to_string();

    // fan out to replicas; single node deployments return immediately
    if let Some(partition_meta) = db::get_partition(&primary) {
        if let Err(e) =
            replication::replicate_write(&primary, partition_meta.version, vec![record.clone()]).await
        {
            log::warn!("[INGEST] replication for {primary} incomplete: {e}");
        }
    }
    // invalidate cached results reading this stream's owning source
    let stream = record
        .tags
        .get(db::STREAM_TAG)
        .map(|s| s.as_str())
        .unwrap_or("default");
    sources::bump_version(&sources::resolve_table(stream));

    Ok(IngestResponse {
        id: record_id,
        partition: primary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ingest_assigns_time_partition() {
        crate::service::partition::init().unwrap();
        let response = ingest(IngestRequest {
            tenant: "ingest_t1".to_string(),
            timestamp: json::json!("2024-01-05T10:00:00Z"),
            payload: json::json!({"user_id": "u1", "amount": 3}),
            geo: None,
            tags: Default::default(),
        })
        .await
        .unwrap();
        assert!(response.partition.starts_with("time/"));
        assert!(!response.id.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_requires_tenant() {
        let err = ingest(IngestRequest {
            tenant: String::new(),
            timestamp: json::json!(0),
            payload: json::json!({}),
            geo: None,
            tags: Default::default(),
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ErrorCode(ErrorCodes::InvalidRequest(_))
        ));
    }
}
