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

//! Row operators. Everything downstream of a scan works on flat json rows;
//! these functions are shared by the local source executor and the
//! coordinator merge.

use std::{cmp::Ordering, collections::HashMap};

use config::{
    meta::{
        partition::TimeGranularity,
        query::{
            AggFunc, AggregateExpr, CmpOp, GeoPredicate, JoinType, OrderBy, Pivot, Predicate,
            ResampleAgg, Scalar, TimeWindow,
        },
    },
    utils::json,
};
use infra::errors::*;

use crate::service::partition::{rollup::apply_agg, time::bucket_start};

pub type Row = json::Value;

pub fn apply_filter(rows: Vec<Row>, predicate: &Predicate) -> Result<Vec<Row>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if eval_predicate(predicate, &row)? {
            out.push(row);
        }
    }
    Ok(out)
}

pub fn eval_predicate(predicate: &Predicate, row: &Row) -> Result<bool> {
    Ok(match predicate {
        Predicate::And(parts) => {
            for part in parts {
                if !eval_predicate(part, row)? {
                    return Ok(false);
                }
            }
            true
        }
        Predicate::Or(parts) => {
            let mut hit = false;
            for part in parts {
                if eval_predicate(part, row)? {
                    hit = true;
                    break;
                }
            }
            hit
        }
        Predicate::Not(inner) => !eval_predicate(inner, row)?,
        Predicate::Cmp { field, op, value } => {
            let field_value = get_field(row, field);
            match (value, field_value) {
                (Scalar::Null, None) => matches!(op, CmpOp::Eq),
                (Scalar::Null, Some(json::Value::Null)) => matches!(op, CmpOp::Eq),
                (Scalar::Null, Some(_)) => matches!(op, CmpOp::Ne),
                (_, None) => false,
                (_, Some(actual)) => match value.compare(actual) {
                    // scalar.compare orders the literal against the row
                    // value, mirror it for field-op-literal semantics
                    Some(ord) => op.matches(ord.reverse()),
                    None => false,
                },
            }
        }
        Predicate::In {
            field,
            values,
            negated,
        } => {
            let hit = match get_field(row, field) {
                Some(actual) => values
                    .iter()
                    .any(|v| v.compare(actual) == Some(Ordering::Equal)),
                None => false,
            };
            hit != *negated
        }
        Predicate::Exists { field, value } => get_field(row, field).is_some() == *value,
        Predicate::Regex { field, pattern } => match get_field(row, field) {
            Some(json::Value::String(s)) => regex::Regex::new(pattern)
                .map_err(|e| {
                    Error::ErrorCode(ErrorCodes::QueryValidationError(format!(
                        "invalid regex: {e}"
                    )))
                })?
                .is_match(s),
            _ => false,
        },
        Predicate::Text { query } => {
            let needle = query.to_lowercase();
            row.as_object()
                .map(|obj| {
                    obj.values().any(|v| match v {
                        json::Value::String(s) => s.to_lowercase().contains(&needle),
                        _ => false,
                    })
                })
                .unwrap_or(false)
        }
        Predicate::Geo(geo) => eval_geo(geo, row),
    })
}

fn eval_geo(geo: &GeoPredicate, row: &Row) -> bool {
    let Some((lat, lon)) = row_point(row) else {
        return false;
    };
    match geo {
        GeoPredicate::Near {
            point,
            max_distance_m,
            ..
        } => haversine_m(point.0, point.1, lat, lon) <= *max_distance_m,
        GeoPredicate::Within { polygon, .. } | GeoPredicate::Intersects { polygon, .. } => {
            crate::service::partition::point_in_ring(lat, lon, polygon)
        }
    }
}

fn row_point(row: &Row) -> Option<(f64, f64)> {
    let obj = row.as_object()?;
    Some((
        obj.get("geo_lat")?.as_f64()?,
        obj.get("geo_lon")?.as_f64()?,
    ))
}

/// great-circle distance in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

pub fn get_field<'a>(row: &'a Row, field: &str) -> Option<&'a json::Value> {
    match row.as_object()?.get(field) {
        Some(v) => Some(v),
        None => json::get_path(row, field),
    }
}

pub fn apply_project(rows: Vec<Row>, columns: &[String]) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            let mut out = json::Map::new();
            for column in columns {
                if let Some(value) = get_field(&row, column) {
                    out.insert(column.clone(), value.clone());
                }
            }
            json::Value::Object(out)
        })
        .collect()
}

pub fn apply_sort(mut rows: Vec<Row>, keys: &[OrderBy]) -> Vec<Row> {
    rows.sort_by(|a, b| {
        for key in keys {
            let ord = compare_values(get_field(a, &key.field), get_field(b, &key.field));
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    rows
}

pub fn compare_values(a: Option<&json::Value>, b: Option<&json::Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

pub fn apply_limit(rows: Vec<Row>, n: i64, offset: i64) -> Vec<Row> {
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(n.max(0) as usize)
        .collect()
}

pub fn apply_aggregate(
    rows: Vec<Row>,
    keys: &[String],
    aggs: &[AggregateExpr],
) -> Result<Vec<Row>> {
    let mut groups: HashMap<Vec<String>, Vec<Row>> = HashMap::new();
    for row in rows {
        let group_key: Vec<String> = keys
            .iter()
            .map(|k| {
                get_field(&row, k)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect();
        groups.entry(group_key).or_default().push(row);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, group) in groups {
        let mut row = json::Map::new();
        for key in keys {
            if let Some(value) = group.first().and_then(|r| get_field(r, key)) {
                row.insert(key.clone(), value.clone());
            }
        }
        for agg in aggs {
            row.insert(agg.alias.clone(), aggregate_value(&group, agg));
        }
        out.push(json::Value::Object(row));
    }
    // deterministic output order
    Ok(apply_sort(
        out,
        &keys
            .iter()
            .map(|k| OrderBy {
                field: k.clone(),
                descending: false,
            })
            .collect::<Vec<_>>(),
    ))
}

fn aggregate_value(group: &[Row], agg: &AggregateExpr) -> json::Value {
    if matches!(agg.func, AggFunc::Count) && agg.field == "*" {
        return json::json!(group.len());
    }
    let mut samples: Vec<f64> = group
        .iter()
        .filter_map(|r| get_field(r, &agg.field))
        .filter_map(|v| v.as_f64())
        .collect();
    if samples.is_empty() && matches!(agg.func, AggFunc::Count) {
        let present = group
            .iter()
            .filter(|r| get_field(r, &agg.field).is_some())
            .count();
        return json::json!(present);
    }
    match apply_agg(&agg.func, &mut samples) {
        Some(value) => {
            if matches!(agg.func, AggFunc::Count) {
                json::json!(value as u64)
            } else {
                json::json!(value)
            }
        }
        None => json::Value::Null,
    }
}

pub fn hash_join(
    left: Vec<Row>,
    right: Vec<Row>,
    join_type: JoinType,
    on: &[(String, String)],
) -> Vec<Row> {
    if join_type == JoinType::Cross || on.is_empty() {
        let mut out = Vec::new();
        for l in &left {
            for r in &right {
                out.push(merge_rows(l, r));
            }
        }
        return out;
    }

    // build side: key on the right-hand fields
    let mut table: HashMap<Vec<String>, Vec<&Row>> = HashMap::new();
    for row in &right {
        let key: Vec<String> = on
            .iter()
            .map(|(_, rf)| {
                get_field(row, rf)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect();
        table.entry(key).or_default().push(row);
    }

    let mut out = Vec::new();
    let mut matched_right: Vec<bool> = vec![false; right.len()];
    for l in &left {
        let key: Vec<String> = on
            .iter()
            .map(|(lf, _)| {
                get_field(l, lf)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect();
        match table.get(&key) {
            Some(matches) => {
                for r in matches {
                    if let Some(pos) = right.iter().position(|row| std::ptr::eq(row, *r)) {
                        matched_right[pos] = true;
                    }
                    out.push(merge_rows(l, r));
                }
            }
            None => {
                if matches!(join_type, JoinType::Left | JoinType::Full) {
                    out.push((*l).clone());
                }
            }
        }
    }
    if matches!(join_type, JoinType::Right | JoinType::Full) {
        for (pos, matched) in matched_right.iter().enumerate() {
            if !matched {
                out.push(right[pos].clone());
            }
        }
    }
    out
}

/// left wins on column collisions, the right copy keeps a suffixed name and
/// exact duplicates are dropped (column deduplication)
fn merge_rows(left: &Row, right: &Row) -> Row {
    let mut out = left.as_object().cloned().unwrap_or_default();
    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            match out.get(k) {
                None => {
                    out.insert(k.clone(), v.clone());
                }
                Some(existing) if existing == v => {} // duplicate column
                Some(_) => {
                    out.insert(format!("{k}_right"), v.clone());
                }
            }
        }
    }
    json::Value::Object(out)
}

pub fn apply_pivot(rows: Vec<Row>, spec: &Pivot) -> Result<Vec<Row>> {
    // group by every column that is neither the pivot column nor the value
    let mut groups: HashMap<String, (json::Map<String, json::Value>, HashMap<String, Vec<f64>>)> =
        HashMap::new();
    for row in &rows {
        let Some(obj) = row.as_object() else { continue };
        let mut base = json::Map::new();
        for (k, v) in obj {
            if k != &spec.column && k != &spec.value_column {
                base.insert(k.clone(), v.clone());
            }
        }
        let group_key = json::Value::Object(base.clone()).to_string();
        let entry = groups.entry(group_key).or_insert_with(|| (base, HashMap::new()));
        let pivot_value = obj
            .get(&spec.column)
            .map(|v| match v {
                json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        if !spec.values.is_empty() && !spec.values.contains(&pivot_value) {
            continue;
        }
        if let Some(n) = obj.get(&spec.value_column).and_then(|v| v.as_f64()) {
            entry.1.entry(pivot_value).or_default().push(n);
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, (mut base, buckets)) in groups {
        for value in &spec.values {
            let mut samples = buckets.get(value).cloned().unwrap_or_default();
            let aggregated = apply_agg(&spec.aggregate, &mut samples);
            base.insert(
                value.clone(),
                aggregated.map(|v| json::json!(v)).unwrap_or(json::Value::Null),
            );
        }
        out.push(json::Value::Object(base));
    }
    Ok(out)
}

/// align rows on a common time grid
pub fn apply_resample(rows: Vec<Row>, window: &TimeWindow) -> Result<Vec<Row>> {
    let granularity: TimeGranularity = window.granularity;
    let mut buckets: HashMap<i64, Vec<Row>> = HashMap::new();
    for row in rows {
        let Some(ts) = get_field(&row, config::COLUMN_TIMESTAMP).and_then(|v| v.as_i64())
        else {
            continue;
        };
        buckets
            .entry(bucket_start(granularity, ts))
            .or_default()
            .push(row);
    }
    let mut out = Vec::with_capacity(buckets.len());
    let mut keys: Vec<i64> = buckets.keys().copied().collect();
    keys.sort_unstable();
    for bucket in keys {
        let group = buckets.remove(&bucket).expect("key exists");
        let mut row = json::Map::new();
        row.insert(config::COLUMN_TIMESTAMP.to_string(), json::json!(bucket));
        match window.agg {
            ResampleAgg::Last => {
                let last = group
                    .iter()
                    .max_by_key(|r| {
                        get_field(r, config::COLUMN_TIMESTAMP)
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0)
                    })
                    .cloned();
                if let Some(json::Value::Object(obj)) = last {
                    for (k, v) in obj {
                        row.entry(k).or_insert(v);
                    }
                }
            }
            ResampleAgg::Mean | ResampleAgg::Sum => {
                let value: Vec<f64> = group
                    .iter()
                    .filter_map(|r| get_field(r, &window.field))
                    .filter_map(|v| v.as_f64())
                    .collect();
                let aggregated = if matches!(window.agg, ResampleAgg::Sum) {
                    value.iter().sum::<f64>()
                } else if value.is_empty() {
                    0.0
                } else {
                    value.iter().sum::<f64>() / value.len() as f64
                };
                row.insert(window.field.clone(), json::json!(aggregated));
            }
        }
        out.push(json::Value::Object(row));
    }
    Ok(out)
}

/// drop duplicate rows keyed on the given columns (all columns when empty)
pub fn deduplicate(rows: Vec<Row>, key_columns: &[String]) -> Vec<Row> {
    let mut seen = hashbrown::HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key = if key_columns.is_empty() {
            row.to_string()
        } else {
            key_columns
                .iter()
                .map(|k| {
                    get_field(&row, k)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "null".to_string())
                })
                .collect::<Vec<_>>()
                .join("\u{1}")
        };
        if seen.insert(key) {
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        vec![
            json::json!({"user_id": "u1", "amount": 10, "_timestamp": 1000}),
            json::json!({"user_id": "u2", "amount": 20, "_timestamp": 2000}),
            json::json!({"user_id": "u1", "amount": 30, "_timestamp": 3000}),
        ]
    }

    #[test]
    fn test_filter_cmp() {
        let predicate = Predicate::Cmp {
            field: "amount".to_string(),
            op: CmpOp::Gte,
            value: Scalar::Int(20),
        };
        let out = apply_filter(rows(), &predicate).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_aggregate_group_count_sum() {
        let out = apply_aggregate(
            rows(),
            &["user_id".to_string()],
            &[
                AggregateExpr {
                    func: AggFunc::Count,
                    field: "*".to_string(),
                    alias: "cnt".to_string(),
                },
                AggregateExpr {
                    func: AggFunc::Sum,
                    field: "amount".to_string(),
                    alias: "total".to_string(),
                },
            ],
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["user_id"], "u1");
        assert_eq!(out[0]["cnt"], 2);
        assert_eq!(out[0]["total"], 40.0);
    }

    #[test]
    fn test_hash_join_inner_and_left() {
        let users = vec![
            json::json!({"user_id": "u1", "name": "ada"}),
            json::json!({"user_id": "u3", "name": "lin"}),
        ];
        let profiles = vec![json::json!({"user_id": "u1", "bio": "hi"})];
        let on = vec![("user_id".to_string(), "user_id".to_string())];

        let inner = hash_join(users.clone(), profiles.clone(), JoinType::Inner, &on);
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0]["bio"], "hi");
        assert_eq!(inner[0]["name"], "ada");

        let left = hash_join(users, profiles, JoinType::Left, &on);
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn test_sort_limit() {
        let sorted = apply_sort(
            rows(),
            &[OrderBy {
                field: "amount".to_string(),
                descending: true,
            }],
        );
        assert_eq!(sorted[0]["amount"], 30);
        let limited = apply_limit(sorted, 2, 1);
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0]["amount"], 20);
    }

    #[test]
    fn test_geo_near() {
        let rows = vec![
            json::json!({"geo_lat": 40.7128, "geo_lon": -74.0060, "name": "nyc"}),
            json::json!({"geo_lat": 51.5074, "geo_lon": -0.1278, "name": "lon"}),
        ];
        let predicate = Predicate::Geo(GeoPredicate::Near {
            field: "loc".to_string(),
            point: (40.7128, -74.0060),
            max_distance_m: 1000.0,
        });
        let out = apply_filter(rows, &predicate).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["name"], "nyc");
    }

    #[test]
    fn test_haversine_known_distance() {
        // nyc to london is about 5570 km
        let d = haversine_m(40.7128, -74.0060, 51.5074, -0.1278);
        assert!((d - 5_570_000.0).abs() < 20_000.0);
    }

    #[test]
    fn test_resample_sum() {
        let rows = vec![
            json::json!({"_timestamp": 1704067200000000i64, "v": 1.0}),
            json::json!({"_timestamp": 1704067260000000i64, "v": 2.0}),
            json::json!({"_timestamp": 1704070800000000i64, "v": 5.0}),
        ];
        let out = apply_resample(
            rows,
            &TimeWindow {
                field: "v".to_string(),
                granularity: TimeGranularity::Hour,
                agg: ResampleAgg::Sum,
            },
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["v"], 3.0);
        assert_eq!(out[1]["v"], 5.0);
    }

    #[test]
    fn test_deduplicate_on_key() {
        let rows = vec![
            json::json!({"k": 1, "v": "a"}),
            json::json!({"k": 1, "v": "b"}),
            json::json!({"k": 2, "v": "c"}),
        ];
        let out = deduplicate(rows, &["k".to_string()]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_pivot() {
        let rows = vec![
            json::json!({"region": "us", "amount": 5.0, "year": 2024}),
            json::json!({"region": "us", "amount": 7.0, "year": 2024}),
            json::json!({"region": "eu", "amount": 3.0, "year": 2024}),
        ];
        let out = apply_pivot(
            rows,
            &Pivot {
                column: "region".to_string(),
                value_column: "amount".to_string(),
                aggregate: AggFunc::Sum,
                values: vec!["us".to_string(), "eu".to_string()],
            },
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["us"], 12.0);
        assert_eq!(out[0]["eu"], 3.0);
        assert_eq!(out[0]["year"], 2024);
    }
}
