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

//! Cache value codec: MessagePack first, JSON when the compact encoder cannot
//! represent the value. The first byte on the wire records which one was used.

use bytes::Bytes;

use crate::errors::*;

const CODEC_MSGPACK: u8 = 0x01;
const CODEC_JSON: u8 = 0x02;

pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    match rmp_serde::to_vec_named(value) {
        Ok(mut packed) => {
            let mut buf = Vec::with_capacity(packed.len() + 1);
            buf.push(CODEC_MSGPACK);
            buf.append(&mut packed);
            Ok(Bytes::from(buf))
        }
        Err(e) => {
            // callers should pre-normalize; the fallback keeps odd types alive
            log::debug!("[CACHE] msgpack encode failed, falling back to json: {e}");
            let mut buf = vec![CODEC_JSON];
            buf.append(&mut config::utils::json::to_vec(value)?);
            Ok(Bytes::from(buf))
        }
    }
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&CODEC_MSGPACK, rest)) => Ok(rmp_serde::from_slice(rest)?),
        Some((&CODEC_JSON, rest)) => Ok(config::utils::json::from_slice(rest)?),
        _ => Err(Error::Message("empty or unknown cache codec".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        rows: Vec<config::utils::json::Value>,
        took_ms: u64,
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let payload = Payload {
            rows: vec![config::utils::json::json!({"user_id": "u1", "cnt": 3})],
            took_ms: 12,
        };
        let encoded = encode(&payload).unwrap();
        assert_eq!(encoded[0], CODEC_MSGPACK);
        let decoded: Payload = decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_json_wire_decodes() {
        let mut buf = vec![CODEC_JSON];
        buf.extend_from_slice(br#"{"rows":[],"took_ms":5}"#);
        let decoded: Payload = decode(&buf).unwrap();
        assert_eq!(decoded.took_ms, 5);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        assert!(decode::<Payload>(&[0x7f, 0x00]).is_err());
        assert!(decode::<Payload>(&[]).is_err());
    }
}
