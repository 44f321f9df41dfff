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

//! The document dialect: `db.collection.verb({...})` with optional chained
//! `.sort/.limit/.skip/.window` calls. Filters use the `$`-operator family;
//! aggregation pipelines, geo predicates, text search, graph traversal and
//! map-reduce all lower to the common AST.

use config::{
    meta::{
        partition::TimeGranularity,
        query::{
            AggFunc, AggregateExpr, AstBody, CmpOp, Dialect, Direction, Find, GeoPredicate,
            GraphTraversal, MapReduce, OrderBy, ParseError, Pipeline, PipelineStage, Predicate,
            QueryAst, ResampleAgg, Scalar, TimeWindow,
        },
    },
    utils::json,
};

use super::{
    DialectParser,
    lexer::{Lexer, Token, TokenType},
};

pub struct NosqlParser;

impl DialectParser for NosqlParser {
    fn dialect(&self) -> Dialect {
        Dialect::Nosql
    }

    fn parse(&self, query: &str) -> Result<QueryAst, ParseError> {
        let tokens = Lexer::new(query).tokenize()?;
        let mut parser = TokenStream::new(tokens);
        let ast = parser.parse_query()?;
        parser.expect_end()?;
        Ok(ast)
    }
}

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    fn new(tokens: Vec<Token>) -> Self {
        TokenStream { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, message: impl Into<String>) -> ParseError {
        match self.peek().or_else(|| self.tokens.last()) {
            Some(token) => ParseError::syntax(token.line, token.column, message)
                .with_token(token.value.clone()),
            None => ParseError::syntax(0, 0, message),
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ParseError> {
        match self.next() {
            Some(token) if token.token_type == TokenType::Punct && token.value == punct => Ok(()),
            Some(token) => Err(ParseError::syntax(
                token.line,
                token.column,
                format!("expected `{punct}`, found `{}`", token.value),
            )
            .with_token(token.value)),
            None => Err(ParseError::syntax(0, 0, format!("expected `{punct}`"))),
        }
    }

    fn expect_identifier(&mut self) -> Result<Token, ParseError> {
        match self.next() {
            Some(token) if token.token_type == TokenType::Identifier => Ok(token),
            Some(token) => Err(ParseError::syntax(
                token.line,
                token.column,
                format!("expected an identifier, found `{}`", token.value),
            )
            .with_token(token.value)),
            None => Err(ParseError::syntax(0, 0, "expected an identifier")),
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        if self.pos < self.tokens.len() {
            return Err(self.error_at("trailing input after query"));
        }
        Ok(())
    }

    fn parse_query(&mut self) -> Result<QueryAst, ParseError> {
        let db = self.expect_identifier()?;
        if db.value != "db" {
            return Err(ParseError::syntax(db.line, db.column, "query must start with `db`")
                .with_token(db.value));
        }
        self.expect_punct(".")?;
        let collection = self.expect_identifier()?.value;
        self.expect_punct(".")?;
        let verb = self.expect_identifier()?;
        let args = self.call_args()?;

        let mut body = match verb.value.as_str() {
            "find" => lower_find(&collection, &args)?,
            "aggregate" => lower_pipeline(&collection, &args)?,
            "graph" => lower_graph(&collection, &args)?,
            "mapReduce" | "map_reduce" => lower_map_reduce(&collection, &args)?,
            other => {
                return Err(ParseError::syntax(
                    verb.line,
                    verb.column,
                    format!("unknown operation: {other}"),
                )
                .with_token(other.to_string()));
            }
        };

        // chained modifiers
        while self.peek().map(|t| t.value == ".").unwrap_or(false) {
            self.expect_punct(".")?;
            let method = self.expect_identifier()?;
            let args = self.call_args()?;
            apply_chain(&mut body, &method, &args)?;
        }

        Ok(QueryAst {
            dialect: Dialect::Nosql,
            body,
        })
    }

    fn call_args(&mut self) -> Result<Vec<json::Value>, ParseError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if self.peek().map(|t| t.value == ")").unwrap_or(false) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.json_value()?);
            match self.next() {
                Some(token) if token.value == "," => continue,
                Some(token) if token.value == ")" => break,
                Some(token) => {
                    return Err(ParseError::syntax(
                        token.line,
                        token.column,
                        format!("expected `,` or `)`, found `{}`", token.value),
                    )
                    .with_token(token.value));
                }
                None => return Err(ParseError::syntax(0, 0, "unterminated call")),
            }
        }
        Ok(args)
    }

    /// JSON with mongo-shell relaxations: unquoted object keys
    fn json_value(&mut self) -> Result<json::Value, ParseError> {
        let Some(token) = self.next() else {
            return Err(ParseError::syntax(0, 0, "expected a value"));
        };
        match (&token.token_type, token.value.as_str()) {
            (TokenType::Punct, "{") => {
                let mut map = json::Map::new();
                if self.peek().map(|t| t.value == "}").unwrap_or(false) {
                    self.next();
                    return Ok(json::Value::Object(map));
                }
                loop {
                    let key = match self.next() {
                        Some(t)
                            if t.token_type == TokenType::Identifier
                                || t.token_type == TokenType::String =>
                        {
                            t.value
                        }
                        Some(t) => {
                            return Err(ParseError::syntax(
                                t.line,
                                t.column,
                                format!("expected an object key, found `{}`", t.value),
                            )
                            .with_token(t.value));
                        }
                        None => return Err(ParseError::syntax(0, 0, "unterminated object")),
                    };
                    self.expect_punct(":")?;
                    map.insert(key, self.json_value()?);
                    match self.next() {
                        Some(t) if t.value == "," => continue,
                        Some(t) if t.value == "}" => break,
                        Some(t) => {
                            return Err(ParseError::syntax(
                                t.line,
                                t.column,
                                format!("expected `,` or `}}`, found `{}`", t.value),
                            )
                            .with_token(t.value));
                        }
                        None => return Err(ParseError::syntax(0, 0, "unterminated object")),
                    }
                }
                Ok(json::Value::Object(map))
            }
            (TokenType::Punct, "[") => {
                let mut items = Vec::new();
                if self.peek().map(|t| t.value == "]").unwrap_or(false) {
                    self.next();
                    return Ok(json::Value::Array(items));
                }
                loop {
                    items.push(self.json_value()?);
                    match self.next() {
                        Some(t) if t.value == "," => continue,
                        Some(t) if t.value == "]" => break,
                        Some(t) => {
                            return Err(ParseError::syntax(
                                t.line,
                                t.column,
                                format!("expected `,` or `]`, found `{}`", t.value),
                            )
                            .with_token(t.value));
                        }
                        None => return Err(ParseError::syntax(0, 0, "unterminated array")),
                    }
                }
                Ok(json::Value::Array(items))
            }
            (TokenType::String, _) => Ok(json::Value::String(token.value)),
            (TokenType::Number, n) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(json::json!(i))
                } else {
                    n.parse::<f64>().map(|f| json::json!(f)).map_err(|_| {
                        ParseError::syntax(token.line, token.column, "invalid number")
                            .with_token(n.to_string())
                    })
                }
            }
            (TokenType::Keyword, "null") => Ok(json::Value::Null),
            (TokenType::Keyword, "true") => Ok(json::Value::Bool(true)),
            (TokenType::Keyword, "false") => Ok(json::Value::Bool(false)),
            (_, other) => Err(ParseError::syntax(
                token.line,
                token.column,
                format!("unexpected token `{other}`"),
            )
            .with_token(other.to_string())),
        }
    }
}

fn lower_find(collection: &str, args: &[json::Value]) -> Result<AstBody, ParseError> {
    let filter = match args.first() {
        None => None,
        Some(json::Value::Object(map)) if map.is_empty() => None,
        Some(value) => json_to_predicate(value)?,
    };
    let projection = match args.get(1) {
        Some(json::Value::Object(map)) => map
            .iter()
            .filter(|(_, v)| v.as_i64() == Some(1) || v.as_bool() == Some(true))
            .map(|(k, _)| k.clone())
            .collect(),
        _ => Vec::new(),
    };
    Ok(AstBody::Find(Find {
        collection: collection.to_string(),
        filter,
        projection,
        ..Default::default()
    }))
}

fn apply_chain(
    body: &mut AstBody,
    method: &Token,
    args: &[json::Value],
) -> Result<(), ParseError> {
    let bad_target = |m: &Token| {
        ParseError::syntax(
            m.line,
            m.column,
            format!("`{}` cannot be chained onto this operation", m.value),
        )
    };
    match method.value.as_str() {
        "sort" => {
            let sort = sort_spec(args.first())?;
            match body {
                AstBody::Find(find) => find.sort = sort,
                AstBody::Pipeline(p) => p.stages.push(PipelineStage::Sort(sort)),
                _ => return Err(bad_target(method)),
            }
        }
        "limit" => {
            let n = args
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| bad_target(method))?;
            match body {
                AstBody::Find(find) => find.limit = Some(n),
                AstBody::Pipeline(p) => p.stages.push(PipelineStage::Limit(n)),
                _ => return Err(bad_target(method)),
            }
        }
        "skip" => {
            let n = args
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| bad_target(method))?;
            match body {
                AstBody::Find(find) => find.skip = Some(n),
                AstBody::Pipeline(p) => p.stages.push(PipelineStage::Skip(n)),
                _ => return Err(bad_target(method)),
            }
        }
        "window" => {
            let window = window_spec(args.first()).ok_or_else(|| bad_target(method))?;
            match body {
                AstBody::Find(find) => find.window = Some(window),
                AstBody::Pipeline(p) => p.stages.push(PipelineStage::Window(window)),
                _ => return Err(bad_target(method)),
            }
        }
        other => {
            return Err(ParseError::syntax(
                method.line,
                method.column,
                format!("unknown chained method: {other}"),
            )
            .with_token(other.to_string()));
        }
    }
    Ok(())
}

fn sort_spec(value: Option<&json::Value>) -> Result<Vec<OrderBy>, ParseError> {
    let Some(json::Value::Object(map)) = value else {
        return Err(ParseError::validation("sort expects an object"));
    };
    Ok(map
        .iter()
        .map(|(field, direction)| OrderBy {
            field: field.clone(),
            descending: direction.as_i64() == Some(-1),
        })
        .collect())
}

fn window_spec(value: Option<&json::Value>) -> Option<TimeWindow> {
    let obj = value?.as_object()?;
    let field = obj
        .get("field")
        .and_then(|v| v.as_str())
        .unwrap_or(config::COLUMN_TIMESTAMP)
        .to_string();
    let granularity: TimeGranularity =
        obj.get("granularity")?.as_str()?.parse().ok()?;
    let agg = match obj.get("agg").and_then(|v| v.as_str()).unwrap_or("last") {
        "mean" | "avg" => ResampleAgg::Mean,
        "sum" => ResampleAgg::Sum,
        _ => ResampleAgg::Last,
    };
    Some(TimeWindow {
        field,
        granularity,
        agg,
    })
}

fn lower_pipeline(collection: &str, args: &[json::Value]) -> Result<AstBody, ParseError> {
    let Some(json::Value::Array(stages)) = args.first() else {
        return Err(ParseError::validation("aggregate expects a stage array"));
    };
    let mut out = Vec::with_capacity(stages.len());
    for stage in stages {
        let obj = stage
            .as_object()
            .ok_or_else(|| ParseError::validation("pipeline stages must be objects"))?;
        let (name, spec) = obj
            .iter()
            .next()
            .ok_or_else(|| ParseError::validation("empty pipeline stage"))?;
        out.push(lower_stage(name, spec)?);
    }
    Ok(AstBody::Pipeline(Pipeline {
        collection: collection.to_string(),
        stages: out,
    }))
}

fn lower_stage(name: &str, spec: &json::Value) -> Result<PipelineStage, ParseError> {
    match name {
        "$match" => Ok(PipelineStage::Match(
            json_to_predicate(spec)?.unwrap_or(Predicate::And(vec![])),
        )),
        "$group" => lower_group(spec),
        "$sort" => Ok(PipelineStage::Sort(sort_spec(Some(spec))?)),
        "$project" => {
            let obj = spec
                .as_object()
                .ok_or_else(|| ParseError::validation("$project expects an object"))?;
            Ok(PipelineStage::Project(
                obj.iter()
                    .filter(|(_, v)| v.as_i64() == Some(1) || v.as_bool() == Some(true))
                    .map(|(k, _)| k.clone())
                    .collect(),
            ))
        }
        "$lookup" => {
            let obj = spec
                .as_object()
                .ok_or_else(|| ParseError::validation("$lookup expects an object"))?;
            let get = |k: &str| -> Result<String, ParseError> {
                obj.get(k)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        ParseError::validation(format!("$lookup requires `{k}`"))
                    })
            };
            Ok(PipelineStage::Lookup {
                from: get("from")?,
                local_field: get("localField")?,
                foreign_field: get("foreignField")?,
                as_field: get("as")?,
            })
        }
        "$unwind" => {
            let path = spec
                .as_str()
                .map(|s| s.trim_start_matches('$').to_string())
                .ok_or_else(|| ParseError::validation("$unwind expects a path string"))?;
            Ok(PipelineStage::Unwind { path })
        }
        "$limit" => spec
            .as_i64()
            .map(PipelineStage::Limit)
            .ok_or_else(|| ParseError::validation("$limit expects an integer")),
        "$skip" => spec
            .as_i64()
            .map(PipelineStage::Skip)
            .ok_or_else(|| ParseError::validation("$skip expects an integer")),
        "$out" => spec
            .as_str()
            .map(|s| PipelineStage::Out {
                collection: s.to_string(),
            })
            .ok_or_else(|| ParseError::validation("$out expects a collection name")),
        "$window" => window_spec(Some(spec))
            .map(PipelineStage::Window)
            .ok_or_else(|| ParseError::validation("malformed $window spec")),
        other => Err(ParseError::validation(format!(
            "unknown pipeline stage: {other}"
        ))),
    }
}

fn lower_group(spec: &json::Value) -> Result<PipelineStage, ParseError> {
    let obj = spec
        .as_object()
        .ok_or_else(|| ParseError::validation("$group expects an object"))?;
    let mut keys = Vec::new();
    match obj.get("_id") {
        Some(json::Value::String(s)) => keys.push(s.trim_start_matches('$').to_string()),
        Some(json::Value::Object(map)) => {
            for value in map.values() {
                if let Some(s) = value.as_str() {
                    keys.push(s.trim_start_matches('$').to_string());
                }
            }
        }
        Some(json::Value::Null) | None => {}
        Some(other) => {
            return Err(ParseError::validation(format!(
                "unsupported $group _id: {other}"
            )));
        }
    }
    let mut aggs = Vec::new();
    for (alias, agg_spec) in obj.iter().filter(|(k, _)| *k != "_id") {
        let agg_obj = agg_spec.as_object().ok_or_else(|| {
            ParseError::validation(format!("accumulator {alias} must be an object"))
        })?;
        let (op, target) = agg_obj
            .iter()
            .next()
            .ok_or_else(|| ParseError::validation(format!("empty accumulator {alias}")))?;
        let func = AggFunc::parse(op.trim_start_matches('$'), target.as_f64())
            .ok_or_else(|| ParseError::validation(format!("unknown accumulator: {op}")))?;
        let field = match target {
            json::Value::String(s) => s.trim_start_matches('$').to_string(),
            _ => "*".to_string(),
        };
        aggs.push(AggregateExpr {
            func,
            field,
            alias: alias.clone(),
        });
    }
    Ok(PipelineStage::Group { keys, aggs })
}

fn lower_graph(collection: &str, args: &[json::Value]) -> Result<AstBody, ParseError> {
    let obj = args
        .first()
        .and_then(|v| v.as_object())
        .ok_or_else(|| ParseError::validation("graph expects an options object"))?;
    let start_node = obj
        .get("startNode")
        .or_else(|| obj.get("start_node"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::validation("graph requires a start node"))?
        .to_string();
    let direction: Direction = obj
        .get("direction")
        .and_then(|v| v.as_str())
        .unwrap_or("any")
        .parse()
        .map_err(ParseError::validation)?;
    let max_depth = obj
        .get("maxDepth")
        .or_else(|| obj.get("max_depth"))
        .and_then(|v| v.as_u64())
        .unwrap_or(3) as u32;
    Ok(AstBody::Graph(GraphTraversal {
        start_node,
        edge_collection: collection.to_string(),
        direction,
        max_depth,
    }))
}

fn lower_map_reduce(collection: &str, args: &[json::Value]) -> Result<AstBody, ParseError> {
    let map_fn = args
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::validation("mapReduce requires a map function"))?
        .to_string();
    let reduce_fn = args
        .get(1)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::validation("mapReduce requires a reduce function"))?
        .to_string();
    let options = args.get(2).and_then(|v| v.as_object());
    let finalize_fn = options
        .and_then(|o| o.get("finalize"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let scope = options
        .and_then(|o| o.get("scope"))
        .and_then(|v| v.as_object())
        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    Ok(AstBody::MapReduce(MapReduce {
        collection: collection.to_string(),
        map_fn,
        reduce_fn,
        finalize_fn,
        scope,
    }))
}

/// `{field: v, $or: [...], field2: {$gte: 5}}` into a predicate tree
pub fn json_to_predicate(value: &json::Value) -> Result<Option<Predicate>, ParseError> {
    let obj = match value {
        json::Value::Object(obj) => obj,
        _ => return Err(ParseError::validation("filter must be an object")),
    };
    let mut parts = Vec::new();
    for (key, spec) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let children = spec
                    .as_array()
                    .ok_or_else(|| {
                        ParseError::validation(format!("{key} expects an array"))
                    })?
                    .iter()
                    .filter_map(|v| json_to_predicate(v).transpose())
                    .collect::<Result<Vec<_>, _>>()?;
                parts.push(if key == "$and" {
                    Predicate::And(children)
                } else {
                    Predicate::Or(children)
                });
            }
            "$not" => {
                if let Some(inner) = json_to_predicate(spec)? {
                    parts.push(Predicate::Not(Box::new(inner)));
                }
            }
            "$text" => {
                let query = spec
                    .as_object()
                    .and_then(|o| o.get("$search"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ParseError::validation("$text requires {$search: \"...\"}")
                    })?;
                parts.push(Predicate::Text {
                    query: query.to_string(),
                });
            }
            field => parts.push(field_predicate(field, spec)?),
        }
    }
    Ok(match parts.len() {
        0 => None,
        1 => Some(parts.remove(0)),
        _ => Some(Predicate::And(parts)),
    })
}

fn field_predicate(field: &str, spec: &json::Value) -> Result<Predicate, ParseError> {
    let obj = match spec {
        json::Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => obj,
        other => {
            return Ok(Predicate::Cmp {
                field: field.to_string(),
                op: CmpOp::Eq,
                value: Scalar::from_json(other),
            });
        }
    };
    let mut parts = Vec::new();
    for (op, value) in obj {
        let cmp = |op: CmpOp| -> Result<Predicate, ParseError> {
            Ok(Predicate::Cmp {
                field: field.to_string(),
                op,
                value: Scalar::from_json(value),
            })
        };
        parts.push(match op.as_str() {
            "$eq" => cmp(CmpOp::Eq)?,
            "$ne" => cmp(CmpOp::Ne)?,
            "$gt" => cmp(CmpOp::Gt)?,
            "$gte" => cmp(CmpOp::Gte)?,
            "$lt" => cmp(CmpOp::Lt)?,
            "$lte" => cmp(CmpOp::Lte)?,
            "$in" | "$nin" => Predicate::In {
                field: field.to_string(),
                values: value
                    .as_array()
                    .ok_or_else(|| {
                        ParseError::validation(format!("{op} expects an array"))
                    })?
                    .iter()
                    .map(Scalar::from_json)
                    .collect(),
                negated: op == "$nin",
            },
            "$exists" => Predicate::Exists {
                field: field.to_string(),
                value: value.as_bool().unwrap_or(true),
            },
            "$regex" => Predicate::Regex {
                field: field.to_string(),
                pattern: value
                    .as_str()
                    .ok_or_else(|| ParseError::validation("$regex expects a string"))?
                    .to_string(),
            },
            "$near" => geo_near(field, value)?,
            "$within" => Predicate::Geo(GeoPredicate::Within {
                field: field.to_string(),
                polygon: polygon_points(value)?,
            }),
            "$intersects" => Predicate::Geo(GeoPredicate::Intersects {
                field: field.to_string(),
                polygon: polygon_points(value)?,
            }),
            other => {
                return Err(ParseError::validation(format!(
                    "unknown filter operator: {other}"
                )));
            }
        });
    }
    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => Predicate::And(parts),
    })
}

fn geo_near(field: &str, value: &json::Value) -> Result<Predicate, ParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::validation("$near expects an object"))?;
    let point = obj
        .get("point")
        .and_then(|v| v.as_array())
        .filter(|a| a.len() == 2)
        .ok_or_else(|| ParseError::validation("$near requires point: [lat, lon]"))?;
    let lat = point[0]
        .as_f64()
        .ok_or_else(|| ParseError::validation("invalid point latitude"))?;
    let lon = point[1]
        .as_f64()
        .ok_or_else(|| ParseError::validation("invalid point longitude"))?;
    let max_distance_m = obj
        .get("maxDistance")
        .or_else(|| obj.get("max_distance"))
        .and_then(|v| v.as_f64())
        .unwrap_or(1000.0);
    Ok(Predicate::Geo(GeoPredicate::Near {
        field: field.to_string(),
        point: (lat, lon),
        max_distance_m,
    }))
}

fn polygon_points(value: &json::Value) -> Result<Vec<(f64, f64)>, ParseError> {
    let points = value
        .as_object()
        .and_then(|o| o.get("polygon"))
        .or(Some(value))
        .and_then(|v| v.as_array())
        .ok_or_else(|| ParseError::validation("polygon expects an array of points"))?;
    points
        .iter()
        .map(|p| {
            let pair = p
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| ParseError::validation("polygon points are [lat, lon]"))?;
            Ok((
                pair[0]
                    .as_f64()
                    .ok_or_else(|| ParseError::validation("invalid latitude"))?,
                pair[1]
                    .as_f64()
                    .ok_or_else(|| ParseError::validation("invalid longitude"))?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(query: &str) -> AstBody {
        NosqlParser.parse(query).unwrap().body
    }

    #[test]
    fn test_find_with_operators() {
        let AstBody::Find(find) = parse(
            r#"db.events.find({user_id: "u1", amount: {$gte: 5, $lt: 100}}, {user_id: 1, amount: 1})"#,
        ) else {
            panic!("expected find");
        };
        assert_eq!(find.collection, "events");
        assert_eq!(find.projection, vec!["amount", "user_id"]);
        let Some(Predicate::And(parts)) = find.filter else {
            panic!("expected AND filter");
        };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_find_chained() {
        let AstBody::Find(find) =
            parse(r#"db.events.find({}).sort({ts: -1}).limit(10).skip(5)"#)
        else {
            panic!("expected find");
        };
        assert_eq!(find.limit, Some(10));
        assert_eq!(find.skip, Some(5));
        assert!(find.sort[0].descending);
    }

    #[test]
    fn test_geo_near() {
        let AstBody::Find(find) = parse(
            r#"db.places.find({loc: {$near: {point: [40.7128, -74.0060], maxDistance: 1000}}})"#,
        ) else {
            panic!("expected find");
        };
        let Some(Predicate::Geo(GeoPredicate::Near {
            point,
            max_distance_m,
            ..
        })) = find.filter
        else {
            panic!("expected near predicate");
        };
        assert!((point.0 - 40.7128).abs() < 1e-9);
        assert!((max_distance_m - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_pipeline() {
        let AstBody::Pipeline(pipeline) = parse(
            r#"db.orders.aggregate([
                {$match: {status: "paid"}},
                {$group: {_id: "$user_id", total: {$sum: "$amount"}}},
                {$sort: {total: -1}},
                {$limit: 5}
            ])"#,
        ) else {
            panic!("expected pipeline");
        };
        assert_eq!(pipeline.stages.len(), 4);
        let PipelineStage::Group { keys, aggs } = &pipeline.stages[1] else {
            panic!("expected group stage");
        };
        assert_eq!(keys, &vec!["user_id".to_string()]);
        assert_eq!(aggs[0].alias, "total");
        assert_eq!(aggs[0].field, "amount");
    }

    #[test]
    fn test_graph_traversal() {
        let AstBody::Graph(graph) = parse(
            r#"db.follows.graph({startNode: "user:1", direction: "outbound", maxDepth: 2})"#,
        ) else {
            panic!("expected graph");
        };
        assert_eq!(graph.edge_collection, "follows");
        assert_eq!(graph.direction, Direction::Outbound);
        assert_eq!(graph.max_depth, 2);
    }

    #[test]
    fn test_map_reduce() {
        let AstBody::MapReduce(mr) = parse(
            r#"db.events.mapReduce("function(d){emit(d.k,1)}", "function(k,v){return v.length}", {scope: {threshold: 5}})"#,
        ) else {
            panic!("expected mapReduce");
        };
        assert!(mr.map_fn.contains("emit"));
        assert_eq!(mr.scope.get("threshold"), Some(&json::json!(5)));
    }

    #[test]
    fn test_error_position() {
        let err = NosqlParser
            .parse("db.events.explode({})")
            .unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 11);
    }
}
