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

//! The dialect independent query AST. SQL and NoSQL parsers both lower to
//! these types; the optimizer and federation layers only ever see this form.

use std::{cmp::Ordering, collections::HashMap, str::FromStr};

use serde::{Deserialize, Serialize};

use super::partition::TimeGranularity;
use crate::utils::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sql,
    Nosql,
}

impl FromStr for Dialect {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sql" => Ok(Dialect::Sql),
            "nosql" => Ok(Dialect::Nosql),
            _ => Err(format!("Invalid dialect: {s}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryAst {
    pub dialect: Dialect,
    pub body: AstBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstBody {
    Select(Select),
    Find(Find),
    Pipeline(Pipeline),
    Graph(GraphTraversal),
    MapReduce(MapReduce),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub projection: Vec<SelectItem>,
    pub from: TableRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<Join>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub having: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<Pivot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpivot: Option<Unpivot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_recognize: Option<MatchRecognize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelClause>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectItem {
    Wildcard,
    Column {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Aggregate {
        func: AggFunc,
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: &str) -> Self {
        TableRef {
            name: name.to_string(),
            alias: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    /// equality pairs (left field, right field)
    pub on: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Percentile(f64),
}

impl AggFunc {
    pub fn parse(name: &str, arg: Option<f64>) -> Option<AggFunc> {
        match name.to_lowercase().as_str() {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" | "mean" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "percentile" => Some(AggFunc::Percentile(arg.unwrap_or(0.5))),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    pub fn matches(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Gte => ord != Ordering::Less,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Lte => ord != Ordering::Greater,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    pub fn from_json(v: &json::Value) -> Scalar {
        match v {
            json::Value::Null => Scalar::Null,
            json::Value::Bool(b) => Scalar::Bool(*b),
            json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Scalar::Int(i)
                } else {
                    Scalar::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            json::Value::String(s) => Scalar::String(s.clone()),
            other => Scalar::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> json::Value {
        match self {
            Scalar::Null => json::Value::Null,
            Scalar::Bool(b) => json::Value::Bool(*b),
            Scalar::Int(i) => json::json!(i),
            Scalar::Float(f) => json::json!(f),
            Scalar::String(s) => json::Value::String(s.clone()),
        }
    }

    /// total-ish ordering used by predicate evaluation, mixed types compare
    /// as strings
    pub fn compare(&self, other: &json::Value) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Null, json::Value::Null) => Some(Ordering::Equal),
            (Scalar::Bool(a), json::Value::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), json::Value::Number(n)) => {
                n.as_f64().and_then(|b| (*a as f64).partial_cmp(&b))
            }
            (Scalar::Float(a), json::Value::Number(n)) => {
                n.as_f64().and_then(|b| a.partial_cmp(&b))
            }
            (Scalar::String(a), json::Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
            (a, b) => a.to_json().to_string().partial_cmp(&b.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Cmp {
        field: String,
        op: CmpOp,
        value: Scalar,
    },
    In {
        field: String,
        values: Vec<Scalar>,
        #[serde(default)]
        negated: bool,
    },
    Exists {
        field: String,
        value: bool,
    },
    Regex {
        field: String,
        pattern: String,
    },
    Text {
        query: String,
    },
    Geo(GeoPredicate),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// every field this predicate references
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Predicate::Cmp { field, .. }
            | Predicate::In { field, .. }
            | Predicate::Exists { field, .. }
            | Predicate::Regex { field, .. } => out.push(field.clone()),
            Predicate::Geo(g) => out.push(g.field().to_string()),
            Predicate::Text { .. } => {}
            Predicate::And(ps) | Predicate::Or(ps) => {
                for p in ps {
                    p.collect_fields(out);
                }
            }
            Predicate::Not(p) => p.collect_fields(out),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GeoPredicate {
    Near {
        field: String,
        point: (f64, f64),
        max_distance_m: f64,
    },
    Within {
        field: String,
        polygon: Vec<(f64, f64)>,
    },
    Intersects {
        field: String,
        polygon: Vec<(f64, f64)>,
    },
}

impl GeoPredicate {
    pub fn field(&self) -> &str {
        match self {
            GeoPredicate::Near { field, .. }
            | GeoPredicate::Within { field, .. }
            | GeoPredicate::Intersects { field, .. } => field,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Find {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projection: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub collection: String,
    pub stages: Vec<PipelineStage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PipelineStage {
    Match(Predicate),
    Group {
        keys: Vec<String>,
        aggs: Vec<AggregateExpr>,
    },
    Sort(Vec<OrderBy>),
    Project(Vec<String>),
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Unwind {
        path: String,
    },
    Limit(i64),
    Skip(i64),
    Out {
        collection: String,
    },
    Window(TimeWindow),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub func: AggFunc,
    pub field: String,
    pub alias: String,
}

/// time-series bucketing attached to a query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub field: String,
    pub granularity: TimeGranularity,
    pub agg: ResampleAgg,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleAgg {
    Last,
    Mean,
    Sum,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphTraversal {
    pub start_node: String,
    pub edge_collection: String,
    pub direction: Direction,
    pub max_depth: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
    Any,
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "outbound" => Ok(Direction::Outbound),
            "inbound" => Ok(Direction::Inbound),
            "any" => Ok(Direction::Any),
            _ => Err(format!("Invalid traversal direction: {s}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapReduce {
    pub collection: String,
    pub map_fn: String,
    pub reduce_fn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_fn: Option<String>,
    #[serde(default)]
    pub scope: HashMap<String, json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub column: String,
    pub value_column: String,
    pub aggregate: AggFunc,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unpivot {
    pub value_column: String,
    pub name_column: String,
    pub columns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchRecognize {
    #[serde(default)]
    pub partition_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    pub pattern: String,
    pub defines: Vec<(String, Predicate)>,
    #[serde(default)]
    pub measures: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelClause {
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    pub rules: Vec<String>,
}

/// parse failures carry the position of the offending token; the parsers
/// never attempt recovery, the first error aborts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: u64,
    pub column: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorKind {
    Syntax,
    Validation,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} error at line {}, column {}: {}",
            self.kind, self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    pub fn syntax(line: u64, column: u64, message: impl Into<String>) -> Self {
        ParseError {
            kind: ParseErrorKind::Syntax,
            line,
            column,
            message: message.into(),
            token: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ParseError {
            kind: ParseErrorKind::Validation,
            line: 0,
            column: 0,
            message: message.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl QueryAst {
    /// stable dictionary form used for caching and logging
    pub fn to_dict(&self) -> json::Value {
        json::to_value(self).unwrap_or(json::Value::Null)
    }

    pub fn from_dict(value: json::Value) -> Result<QueryAst, json::Error> {
        json::from_value(value)
    }

    /// the tables/collections the query touches, joins and lookups included
    pub fn tables(&self) -> Vec<String> {
        let mut out = Vec::new();
        match &self.body {
            AstBody::Select(s) => {
                out.push(s.from.name.clone());
                for j in &s.joins {
                    out.push(j.table.name.clone());
                }
            }
            AstBody::Find(f) => out.push(f.collection.clone()),
            AstBody::Pipeline(p) => {
                out.push(p.collection.clone());
                for stage in &p.stages {
                    if let PipelineStage::Lookup { from, .. } = stage {
                        out.push(from.clone());
                    }
                }
            }
            AstBody::Graph(g) => out.push(g.edge_collection.clone()),
            AstBody::MapReduce(m) => out.push(m.collection.clone()),
        }
        out.sort();
        out.dedup();
        out
    }
}

/// Exhaustive walk over the AST. Implementors override the hooks they care
/// about; the default walks children.
pub trait AstVisitor {
    fn pre_visit_predicate(&mut self, _predicate: &Predicate) {}
    fn visit_select(&mut self, _select: &Select) {}
    fn visit_find(&mut self, _find: &Find) {}
    fn visit_pipeline(&mut self, _pipeline: &Pipeline) {}
    fn visit_graph(&mut self, _graph: &GraphTraversal) {}
    fn visit_map_reduce(&mut self, _map_reduce: &MapReduce) {}
    fn visit_table(&mut self, _table: &TableRef) {}
}

pub fn walk_ast<V: AstVisitor>(visitor: &mut V, ast: &QueryAst) {
    match &ast.body {
        AstBody::Select(s) => {
            visitor.visit_select(s);
            visitor.visit_table(&s.from);
            for j in &s.joins {
                visitor.visit_table(&j.table);
            }
            if let Some(p) = &s.selection {
                walk_predicate(visitor, p);
            }
            if let Some(p) = &s.having {
                walk_predicate(visitor, p);
            }
        }
        AstBody::Find(f) => {
            visitor.visit_find(f);
            if let Some(p) = &f.filter {
                walk_predicate(visitor, p);
            }
        }
        AstBody::Pipeline(p) => {
            visitor.visit_pipeline(p);
            for stage in &p.stages {
                if let PipelineStage::Match(pred) = stage {
                    walk_predicate(visitor, pred);
                }
            }
        }
        AstBody::Graph(g) => visitor.visit_graph(g),
        AstBody::MapReduce(m) => visitor.visit_map_reduce(m),
    }
}

pub fn walk_predicate<V: AstVisitor + ?Sized>(visitor: &mut V, predicate: &Predicate) {
    visitor.pre_visit_predicate(predicate);
    match predicate {
        Predicate::And(ps) | Predicate::Or(ps) => {
            for p in ps {
                walk_predicate(visitor, p);
            }
        }
        Predicate::Not(p) => walk_predicate(visitor, p),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_select() -> QueryAst {
        QueryAst {
            dialect: Dialect::Sql,
            body: AstBody::Select(Select {
                projection: vec![
                    SelectItem::Column {
                        name: "user_id".to_string(),
                        alias: None,
                    },
                    SelectItem::Aggregate {
                        func: AggFunc::Count,
                        field: "*".to_string(),
                        alias: Some("cnt".to_string()),
                    },
                ],
                from: TableRef::new("events"),
                selection: Some(Predicate::And(vec![
                    Predicate::Cmp {
                        field: "_timestamp".to_string(),
                        op: CmpOp::Gte,
                        value: Scalar::Int(1704067200000000),
                    },
                    Predicate::Cmp {
                        field: "_timestamp".to_string(),
                        op: CmpOp::Lt,
                        value: Scalar::Int(1706745600000000),
                    },
                ])),
                group_by: vec!["user_id".to_string()],
                limit: Some(10),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_dict_roundtrip() {
        let ast = sample_select();
        let dict = ast.to_dict();
        let back = QueryAst::from_dict(dict.clone()).unwrap();
        assert_eq!(ast, back);
        // the dictionary form must be stable for cache keying
        assert_eq!(dict.to_string(), back.to_dict().to_string());
    }

    #[test]
    fn test_predicate_fields() {
        let p = Predicate::Or(vec![
            Predicate::Cmp {
                field: "b".to_string(),
                op: CmpOp::Eq,
                value: Scalar::Int(1),
            },
            Predicate::Not(Box::new(Predicate::Exists {
                field: "a".to_string(),
                value: true,
            })),
        ]);
        assert_eq!(p.fields(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_visitor_walks_predicates() {
        struct Counter(usize);
        impl AstVisitor for Counter {
            fn pre_visit_predicate(&mut self, _p: &Predicate) {
                self.0 += 1;
            }
        }
        let ast = sample_select();
        let mut counter = Counter(0);
        walk_ast(&mut counter, &ast);
        // And node plus its two children
        assert_eq!(counter.0, 3);
    }

    #[test]
    fn test_cmp_op_matches() {
        assert!(CmpOp::Gte.matches(Ordering::Equal));
        assert!(CmpOp::Gte.matches(Ordering::Greater));
        assert!(!CmpOp::Gte.matches(Ordering::Less));
        assert!(CmpOp::Ne.matches(Ordering::Less));
    }
}
