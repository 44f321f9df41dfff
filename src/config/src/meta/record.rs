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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The atomic unit of the lake. Written once, never updated in place,
/// deleted only through retention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub tenant: String,
    /// event time in UTC microseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoPoint>,
    /// opaque payload bytes with a declared logical type
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub payload_type: PayloadType,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        GeoPoint { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    #[default]
    Json,
    Text,
    Binary,
    Vector,
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadType::Json => write!(f, "json"),
            PayloadType::Text => write!(f, "text"),
            PayloadType::Binary => write!(f, "binary"),
            PayloadType::Vector => write!(f, "vector"),
        }
    }
}

mod payload_base64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Record {
    pub fn json_payload(&self) -> Result<crate::utils::json::Value, crate::utils::json::Error> {
        crate::utils::json::from_slice(&self.payload)
    }

    pub fn size(&self) -> usize {
        self.id.len()
            + self.tenant.len()
            + 8
            + self.payload.len()
            + self.tags.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            id: "01h".to_string(),
            tenant: "default".to_string(),
            timestamp: 1704067200000000,
            geo: Some(GeoPoint::new(40.7128, -74.0060)),
            payload: br#"{"user_id":"u1"}"#.to_vec(),
            payload_type: PayloadType::Json,
            tags: HashMap::from([("event_type".to_string(), "login".to_string())]),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let r = sample();
        let s = crate::utils::json::to_string(&r).unwrap();
        let r2: Record = crate::utils::json::from_str(&s).unwrap();
        assert_eq!(r, r2);
    }

    #[test]
    fn test_geo_point_bounds() {
        assert!(GeoPoint::new(40.0, -74.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
    }
}
