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

//! SQL dialect. sqlparser's GenericDialect drives the grammar; the statement
//! lowers into the common AST through `TryFrom`. PIVOT/UNPIVOT,
//! MATCH_RECOGNIZE and MODEL have no native form in the generic dialect, so
//! their clauses are lifted out of the text before the main parse.

use config::{
    get_config,
    meta::query::{
        AggFunc, AstBody, CmpOp, Dialect, Join, JoinType, MatchRecognize, ModelClause, OrderBy,
        ParseError, Pivot, Predicate, QueryAst, Scalar, Select, SelectItem, TableRef, Unpivot,
    },
};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::{
    ast::{
        BinaryOperator, Expr as SqlExpr, Function, FunctionArg, FunctionArgExpr,
        FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator, ObjectName,
        Offset as SqlOffset, OrderByExpr, Query, SelectItem as SqlSelectItem, SetExpr, Statement,
        TableFactor, UnaryOperator, Value,
    },
    dialect::GenericDialect,
    parser::Parser,
};

use super::DialectParser;

static ERROR_POSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Line:\s*(\d+),\s*Column:?\s*(\d+)").expect("valid regex"));

pub struct SqlParser;

impl DialectParser for SqlParser {
    fn dialect(&self) -> Dialect {
        Dialect::Sql
    }

    fn parse(&self, query: &str) -> Result<QueryAst, ParseError> {
        if query.trim().is_empty() {
            return Err(ParseError::validation("SQL is empty"));
        }
        let (stripped, extensions) = extract_extensions(query)?;
        let statements = Parser::parse_sql(&GenericDialect {}, &stripped)
            .map_err(|e| syntax_error(&e.to_string()))?;
        let statement = statements
            .first()
            .ok_or_else(|| ParseError::validation("SQL is empty"))?;
        let mut select = select_from_statement(statement)?;
        select.pivot = extensions.pivot;
        select.unpivot = extensions.unpivot;
        select.match_recognize = extensions.match_recognize;
        select.model = extensions.model;
        Ok(QueryAst {
            dialect: Dialect::Sql,
            body: AstBody::Select(select),
        })
    }
}

fn syntax_error(message: &str) -> ParseError {
    let (line, column) = ERROR_POSITION
        .captures(message)
        .map(|c| {
            (
                c[1].parse().unwrap_or(0),
                c[2].parse().unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    ParseError::syntax(line, column, message.to_string())
}

fn select_from_statement(statement: &Statement) -> Result<Select, ParseError> {
    let Statement::Query(query) = statement else {
        return Err(ParseError::validation(
            "only SELECT statements are supported",
        ));
    };
    select_from_query(query)
}

fn select_from_query(query: &Query) -> Result<Select, ParseError> {
    let SetExpr::Select(body) = query.body.as_ref() else {
        return Err(ParseError::validation(
            "only plain SELECT bodies are supported",
        ));
    };

    let cfg = get_config();
    let mut select = Select::default();

    // projection
    for item in &body.projection {
        select.projection.push(projection_item(item)?);
    }
    if select.projection.is_empty() {
        return Err(ParseError::validation("projection cannot be empty"));
    }

    // from + joins
    let Some(table) = body.from.first() else {
        return Err(ParseError::validation("FROM clause is required"));
    };
    select.from = table_ref(&table.relation)?;
    for join in &table.joins {
        select.joins.push(lower_join(join)?);
    }
    if body.from.len() > 1 {
        // comma joins become cross joins
        for extra in &body.from[1..] {
            select.joins.push(Join {
                join_type: JoinType::Cross,
                table: table_ref(&extra.relation)?,
                on: vec![],
            });
        }
    }

    // where / having
    select.selection = body
        .selection
        .as_ref()
        .map(expr_to_predicate)
        .transpose()?;
    select.having = body.having.as_ref().map(expr_to_predicate).transpose()?;

    // group by
    if let GroupByExpr::Expressions(exprs) = &body.group_by {
        for expr in exprs {
            select.group_by.push(field_name(expr)?);
        }
    }

    // order by
    for OrderByExpr { expr, asc, .. } in &query.order_by {
        select.order_by.push(OrderBy {
            field: field_name(expr)?,
            descending: matches!(asc, Some(false)),
        });
    }

    // limit / offset with caps
    if let Some(limit) = &query.limit {
        let n = literal_i64(limit)?;
        if n < 0 || n > cfg.limit.sql_max_limit {
            return Err(ParseError::validation(format!(
                "LIMIT must be in 0..={}",
                cfg.limit.sql_max_limit
            )));
        }
        select.limit = Some(n);
    }
    if let Some(SqlOffset { value, .. }) = &query.offset {
        let n = literal_i64(value)?;
        if n < 0 || n > cfg.limit.sql_max_offset {
            return Err(ParseError::validation(format!(
                "OFFSET must be in 0..={}",
                cfg.limit.sql_max_offset
            )));
        }
        select.offset = Some(n);
    }

    Ok(select)
}

fn projection_item(item: &SqlSelectItem) -> Result<SelectItem, ParseError> {
    match item {
        SqlSelectItem::Wildcard(_) | SqlSelectItem::QualifiedWildcard(_, _) => {
            Ok(SelectItem::Wildcard)
        }
        SqlSelectItem::UnnamedExpr(expr) => lower_projection_expr(expr, None),
        SqlSelectItem::ExprWithAlias { expr, alias } => {
            lower_projection_expr(expr, Some(alias.value.clone()))
        }
    }
}

fn lower_projection_expr(
    expr: &SqlExpr,
    alias: Option<String>,
) -> Result<SelectItem, ParseError> {
    match expr {
        SqlExpr::Identifier(_) | SqlExpr::CompoundIdentifier(_) => Ok(SelectItem::Column {
            name: field_name(expr)?,
            alias,
        }),
        SqlExpr::Function(func) => {
            let (agg, field) = aggregate_call(func)?;
            Ok(SelectItem::Aggregate {
                func: agg,
                field,
                alias,
            })
        }
        other => Err(ParseError::validation(format!(
            "unsupported projection expression: {other}"
        ))),
    }
}

fn aggregate_call(func: &Function) -> Result<(AggFunc, String), ParseError> {
    let name = object_name(&func.name).to_lowercase();
    let args = match &func.args {
        FunctionArguments::List(list) => &list.args,
        FunctionArguments::None => {
            return Err(ParseError::validation(format!(
                "aggregate {name} requires arguments"
            )));
        }
        FunctionArguments::Subquery(_) => {
            return Err(ParseError::validation("subquery arguments are unsupported"));
        }
    };
    let mut field = "*".to_string();
    let mut numeric_arg = None;
    for arg in args {
        match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {}
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => match expr {
                SqlExpr::Value(Value::Number(n, _)) => {
                    numeric_arg = n.parse::<f64>().ok();
                }
                _ => field = field_name(expr)?,
            },
            other => {
                return Err(ParseError::validation(format!(
                    "unsupported aggregate argument: {other}"
                )));
            }
        }
    }
    let agg = AggFunc::parse(&name, numeric_arg)
        .ok_or_else(|| ParseError::validation(format!("unknown aggregate function: {name}")))?;
    Ok((agg, field))
}

fn lower_join(join: &sqlparser::ast::Join) -> Result<Join, ParseError> {
    let (join_type, constraint) = match &join.join_operator {
        JoinOperator::Inner(c) => (JoinType::Inner, Some(c)),
        JoinOperator::LeftOuter(c) => (JoinType::Left, Some(c)),
        JoinOperator::RightOuter(c) => (JoinType::Right, Some(c)),
        JoinOperator::FullOuter(c) => (JoinType::Full, Some(c)),
        JoinOperator::CrossJoin => (JoinType::Cross, None),
        other => {
            return Err(ParseError::validation(format!(
                "unsupported join operator: {other:?}"
            )));
        }
    };
    let on = match constraint {
        Some(JoinConstraint::On(expr)) => join_pairs(expr)?,
        Some(JoinConstraint::Using(idents)) => idents
            .iter()
            .map(|i| (i.value.clone(), i.value.clone()))
            .collect(),
        Some(JoinConstraint::Natural) | Some(JoinConstraint::None) | None => vec![],
    };
    Ok(Join {
        join_type,
        table: table_ref(&join.relation)?,
        on,
    })
}

fn join_pairs(expr: &SqlExpr) -> Result<Vec<(String, String)>, ParseError> {
    match expr {
        SqlExpr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => Ok(vec![(field_name(left)?, field_name(right)?)]),
        SqlExpr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut pairs = join_pairs(left)?;
            pairs.extend(join_pairs(right)?);
            Ok(pairs)
        }
        SqlExpr::Nested(inner) => join_pairs(inner),
        other => Err(ParseError::validation(format!(
            "only equality join conditions are supported, found {other}"
        ))),
    }
}

fn table_ref(factor: &TableFactor) -> Result<TableRef, ParseError> {
    match factor {
        TableFactor::Table { name, alias, .. } => Ok(TableRef {
            name: object_name(name),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
        }),
        other => Err(ParseError::validation(format!(
            "unsupported table factor: {other}"
        ))),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

/// the bare column name, alias qualifiers dropped
fn field_name(expr: &SqlExpr) -> Result<String, ParseError> {
    match expr {
        SqlExpr::Identifier(ident) => Ok(ident.value.clone()),
        SqlExpr::CompoundIdentifier(idents) => Ok(idents
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default()),
        SqlExpr::Nested(inner) => field_name(inner),
        other => Err(ParseError::validation(format!(
            "expected a column reference, found {other}"
        ))),
    }
}

fn literal_i64(expr: &SqlExpr) -> Result<i64, ParseError> {
    match expr {
        SqlExpr::Value(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| ParseError::validation(format!("invalid integer literal: {n}"))),
        other => Err(ParseError::validation(format!(
            "expected an integer literal, found {other}"
        ))),
    }
}

fn literal_scalar(expr: &SqlExpr) -> Result<Scalar, ParseError> {
    match expr {
        SqlExpr::Value(value) => Ok(match value {
            Value::Number(n, _) => match n.parse::<i64>() {
                Ok(i) => Scalar::Int(i),
                Err(_) => Scalar::Float(n.parse().map_err(|_| {
                    ParseError::validation(format!("invalid number literal: {n}"))
                })?),
            },
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
                Scalar::String(s.clone())
            }
            Value::Boolean(b) => Scalar::Bool(*b),
            Value::Null => Scalar::Null,
            other => {
                return Err(ParseError::validation(format!(
                    "unsupported literal: {other}"
                )));
            }
        }),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal_scalar(expr)? {
            Scalar::Int(i) => Ok(Scalar::Int(-i)),
            Scalar::Float(f) => Ok(Scalar::Float(-f)),
            other => Err(ParseError::validation(format!(
                "cannot negate literal {other:?}"
            ))),
        },
        other => Err(ParseError::validation(format!(
            "expected a literal, found {other}"
        ))),
    }
}

pub fn expr_to_predicate(expr: &SqlExpr) -> Result<Predicate, ParseError> {
    match expr {
        SqlExpr::Nested(inner) => expr_to_predicate(inner),
        SqlExpr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(flatten_and(
                expr_to_predicate(left)?,
                expr_to_predicate(right)?,
            )),
            BinaryOperator::Or => Ok(flatten_or(
                expr_to_predicate(left)?,
                expr_to_predicate(right)?,
            )),
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq => comparison(left, op, right),
            other => Err(ParseError::validation(format!(
                "unsupported operator: {other}"
            ))),
        },
        SqlExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Predicate::Not(Box::new(expr_to_predicate(expr)?))),
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => Ok(Predicate::In {
            field: field_name(expr)?,
            values: list
                .iter()
                .map(literal_scalar)
                .collect::<Result<Vec<_>, _>>()?,
            negated: *negated,
        }),
        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let field = field_name(expr)?;
            let range = Predicate::And(vec![
                Predicate::Cmp {
                    field: field.clone(),
                    op: CmpOp::Gte,
                    value: literal_scalar(low)?,
                },
                Predicate::Cmp {
                    field,
                    op: CmpOp::Lte,
                    value: literal_scalar(high)?,
                },
            ]);
            Ok(if *negated {
                Predicate::Not(Box::new(range))
            } else {
                range
            })
        }
        SqlExpr::IsNull(inner) => Ok(Predicate::Cmp {
            field: field_name(inner)?,
            op: CmpOp::Eq,
            value: Scalar::Null,
        }),
        SqlExpr::IsNotNull(inner) => Ok(Predicate::Cmp {
            field: field_name(inner)?,
            op: CmpOp::Ne,
            value: Scalar::Null,
        }),
        SqlExpr::Like {
            negated,
            expr,
            pattern,
            ..
        } => {
            let regex = match literal_scalar(pattern)? {
                Scalar::String(s) => like_to_regex(&s),
                other => {
                    return Err(ParseError::validation(format!(
                        "LIKE pattern must be a string, found {other:?}"
                    )));
                }
            };
            let like = Predicate::Regex {
                field: field_name(expr)?,
                pattern: regex,
            };
            Ok(if *negated {
                Predicate::Not(Box::new(like))
            } else {
                like
            })
        }
        other => Err(ParseError::validation(format!(
            "unsupported predicate: {other}"
        ))),
    }
}

fn comparison(
    left: &SqlExpr,
    op: &BinaryOperator,
    right: &SqlExpr,
) -> Result<Predicate, ParseError> {
    let cmp = |op: &BinaryOperator| match op {
        BinaryOperator::Eq => CmpOp::Eq,
        BinaryOperator::NotEq => CmpOp::Ne,
        BinaryOperator::Gt => CmpOp::Gt,
        BinaryOperator::GtEq => CmpOp::Gte,
        BinaryOperator::Lt => CmpOp::Lt,
        BinaryOperator::LtEq => CmpOp::Lte,
        _ => unreachable!("caller checked the operator"),
    };
    // column on the left, or literal-first with the operator mirrored
    if let Ok(field) = field_name(left) {
        Ok(Predicate::Cmp {
            field,
            op: cmp(op),
            value: literal_scalar(right)?,
        })
    } else {
        let mirrored = match cmp(op) {
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Gte => CmpOp::Lte,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Lte => CmpOp::Gte,
            other => other,
        };
        Ok(Predicate::Cmp {
            field: field_name(right)?,
            op: mirrored,
            value: literal_scalar(left)?,
        })
    }
}

fn flatten_and(left: Predicate, right: Predicate) -> Predicate {
    let mut parts = Vec::new();
    for p in [left, right] {
        match p {
            Predicate::And(mut inner) => parts.append(&mut inner),
            other => parts.push(other),
        }
    }
    Predicate::And(parts)
}

fn flatten_or(left: Predicate, right: Predicate) -> Predicate {
    let mut parts = Vec::new();
    for p in [left, right] {
        match p {
            Predicate::Or(mut inner) => parts.append(&mut inner),
            other => parts.push(other),
        }
    }
    Predicate::Or(parts)
}

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c if "\\.+*?()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

#[derive(Default)]
struct Extensions {
    pivot: Option<Pivot>,
    unpivot: Option<Unpivot>,
    match_recognize: Option<MatchRecognize>,
    model: Option<ModelClause>,
}

/// lift `KEYWORD ( ... )` extension clauses out of the raw text
fn extract_extensions(sql: &str) -> Result<(String, Extensions), ParseError> {
    let mut out = Extensions::default();
    let mut text = sql.to_string();
    if let Some(inner) = take_clause(&mut text, "MATCH_RECOGNIZE")? {
        out.match_recognize = Some(parse_match_recognize(&inner)?);
    }
    if let Some(inner) = take_clause(&mut text, "UNPIVOT")? {
        out.unpivot = Some(parse_unpivot(&inner)?);
    }
    if let Some(inner) = take_clause(&mut text, "PIVOT")? {
        out.pivot = Some(parse_pivot(&inner)?);
    }
    if let Some(inner) = take_clause(&mut text, "MODEL")? {
        out.model = Some(parse_model(&inner)?);
    }
    Ok((text, out))
}

/// remove the first `keyword ( balanced )` occurrence, returning the innards
fn take_clause(text: &mut String, keyword: &str) -> Result<Option<String>, ParseError> {
    let upper = text.to_uppercase();
    let mut search_from = 0;
    while let Some(rel) = upper[search_from..].find(keyword) {
        let start = search_from + rel;
        // must be a standalone word
        let before_ok = start == 0
            || !upper.as_bytes()[start - 1].is_ascii_alphanumeric()
                && upper.as_bytes()[start - 1] != b'_';
        let after = start + keyword.len();
        let after_ok = upper[after..].trim_start().starts_with('(');
        if !before_ok || !after_ok {
            search_from = after;
            continue;
        }
        let open = after + upper[after..].find('(').expect("checked above");
        let mut depth = 0usize;
        let mut in_string = false;
        for (i, c) in text[open..].char_indices() {
            match c {
                '\'' => in_string = !in_string,
                '(' if !in_string => depth += 1,
                ')' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = text[open + 1..open + i].to_string();
                        text.replace_range(start..open + i + 1, "");
                        return Ok(Some(inner));
                    }
                }
                _ => {}
            }
        }
        return Err(ParseError::validation(format!(
            "unbalanced parentheses in {keyword} clause"
        )));
    }
    Ok(None)
}

/// `agg(col) FOR key IN (v1, v2, ...)`
fn parse_pivot(inner: &str) -> Result<Pivot, ParseError> {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)^\s*(\w+)\s*\(\s*([\w*]+)\s*\)\s+FOR\s+(\w+)\s+IN\s*\((.*)\)\s*$")
            .expect("valid regex")
    });
    let caps = RE
        .captures(inner)
        .ok_or_else(|| ParseError::validation("malformed PIVOT clause"))?;
    let aggregate = AggFunc::parse(&caps[1], None)
        .ok_or_else(|| ParseError::validation(format!("unknown aggregate: {}", &caps[1])))?;
    Ok(Pivot {
        aggregate,
        value_column: caps[2].to_string(),
        column: caps[3].to_string(),
        values: split_list(&caps[4]),
    })
}

/// `value_col FOR name_col IN (c1, c2, ...)`
fn parse_unpivot(inner: &str) -> Result<Unpivot, ParseError> {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)^\s*(\w+)\s+FOR\s+(\w+)\s+IN\s*\((.*)\)\s*$").expect("valid regex")
    });
    let caps = RE
        .captures(inner)
        .ok_or_else(|| ParseError::validation("malformed UNPIVOT clause"))?;
    Ok(Unpivot {
        value_column: caps[1].to_string(),
        name_column: caps[2].to_string(),
        columns: split_list(&caps[3]),
    })
}

/// `PARTITION BY a, b ORDER BY c PATTERN (A B+) DEFINE A AS x > 1, B AS y < 2`
fn parse_match_recognize(inner: &str) -> Result<MatchRecognize, ParseError> {
    static PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)PATTERN\s*\(([^)]*)\)").expect("valid regex"));
    static PARTITION: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)PARTITION\s+BY\s+(.+?)(?:ORDER\s+BY|PATTERN|DEFINE|$)")
            .expect("valid regex")
    });
    static ORDER: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)ORDER\s+BY\s+(.+?)(?:PATTERN|DEFINE|$)").expect("valid regex")
    });
    static DEFINE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)DEFINE\s+(.+)$").expect("valid regex"));

    let pattern = PATTERN
        .captures(inner)
        .map(|c| c[1].trim().to_string())
        .ok_or_else(|| ParseError::validation("MATCH_RECOGNIZE requires a PATTERN"))?;
    let partition_by = PARTITION
        .captures(inner)
        .map(|c| split_list(&c[1]))
        .unwrap_or_default();
    let order_by = ORDER
        .captures(inner)
        .map(|c| {
            split_list(&c[1])
                .into_iter()
                .filter_map(|entry| {
                    let mut parts = entry.split_whitespace();
                    let field = parts.next()?.to_string();
                    let descending = parts
                        .next()
                        .map(|d| d.eq_ignore_ascii_case("desc"))
                        .unwrap_or(false);
                    Some(OrderBy { field, descending })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut defines = Vec::new();
    if let Some(caps) = DEFINE.captures(inner) {
        for part in split_top_level(&caps[1]) {
            let Some((name, condition)) = split_once_keyword(&part, " AS ") else {
                return Err(ParseError::validation(format!(
                    "malformed DEFINE entry: {part}"
                )));
            };
            let expr = parse_standalone_expr(&condition)?;
            defines.push((name.trim().to_string(), expr_to_predicate(&expr)?));
        }
    }

    Ok(MatchRecognize {
        partition_by,
        order_by,
        pattern,
        defines,
        measures: vec![],
    })
}

/// `DIMENSION BY (a, b) MEASURES (x) RULES (x[1] = x[0] * 2)`
fn parse_model(inner: &str) -> Result<ModelClause, ParseError> {
    static DIMENSION: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)DIMENSION\s+BY\s*\(([^)]*)\)").expect("valid regex")
    });
    static MEASURES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)MEASURES\s*\(([^)]*)\)").expect("valid regex"));
    static RULES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)RULES\s*\((.*)\)\s*$").expect("valid regex"));

    let dimensions = DIMENSION
        .captures(inner)
        .map(|c| split_list(&c[1]))
        .unwrap_or_default();
    let measures = MEASURES
        .captures(inner)
        .map(|c| split_list(&c[1]))
        .unwrap_or_default();
    let rules = RULES
        .captures(inner)
        .map(|c| split_top_level(&c[1]))
        .unwrap_or_default();
    if dimensions.is_empty() || measures.is_empty() {
        return Err(ParseError::validation(
            "MODEL requires DIMENSION BY and MEASURES",
        ));
    }
    Ok(ModelClause {
        dimensions,
        measures,
        rules,
    })
}

fn parse_standalone_expr(text: &str) -> Result<SqlExpr, ParseError> {
    Parser::new(&GenericDialect {})
        .try_with_sql(text)
        .map_err(|e| syntax_error(&e.to_string()))?
        .parse_expr()
        .map_err(|e| syntax_error(&e.to_string()))
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// split on top-level commas, quotes respected
fn split_top_level(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' | '[' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' if !in_string => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 && !in_string => {
                out.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn split_once_keyword(text: &str, keyword: &str) -> Option<(String, String)> {
    let upper = text.to_uppercase();
    let idx = upper.find(&keyword.to_uppercase())?;
    Some((
        text[..idx].to_string(),
        text[idx + keyword.len()..].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> Select {
        let ast = SqlParser.parse(sql).unwrap();
        match ast.body {
            AstBody::Select(select) => select,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn test_basic_select() {
        let select = parse(
            "SELECT user_id, COUNT(*) AS cnt FROM events \
             WHERE ts >= '2024-01-01T00:00:00Z' AND ts < '2024-02-01' \
             GROUP BY user_id ORDER BY cnt DESC LIMIT 10",
        );
        assert_eq!(select.from.name, "events");
        assert_eq!(select.projection.len(), 2);
        assert_eq!(select.group_by, vec!["user_id"]);
        assert_eq!(select.limit, Some(10));
        assert!(select.order_by[0].descending);
        match &select.selection {
            Some(Predicate::And(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn test_joins() {
        let select = parse(
            "SELECT u.user_id FROM users u \
             INNER JOIN profiles p ON u.user_id = p.user_id \
             LEFT JOIN orders o ON o.user_id = u.user_id",
        );
        assert_eq!(select.joins.len(), 2);
        assert_eq!(select.joins[0].join_type, JoinType::Inner);
        assert_eq!(
            select.joins[0].on,
            vec![("user_id".to_string(), "user_id".to_string())]
        );
        assert_eq!(select.joins[1].join_type, JoinType::Left);
        assert_eq!(select.joins[1].table.alias.as_deref(), Some("o"));
    }

    #[test]
    fn test_predicates() {
        let select = parse(
            "SELECT * FROM events WHERE a IN (1, 2) AND b BETWEEN 5 AND 9 \
             AND c LIKE 'pre%' AND d IS NULL AND NOT (e = 'x' OR f > 3)",
        );
        let Some(Predicate::And(parts)) = select.selection else {
            panic!("expected AND");
        };
        // IN + BETWEEN(2) + LIKE + IS NULL + NOT = 6 flattened parts
        assert_eq!(parts.len(), 6);
        assert!(parts.iter().any(|p| matches!(p, Predicate::Regex { .. })));
        assert!(parts.iter().any(|p| matches!(p, Predicate::Not(_))));
    }

    #[test]
    fn test_literal_first_comparison_mirrors() {
        let select = parse("SELECT * FROM events WHERE 10 > amount");
        assert_eq!(
            select.selection,
            Some(Predicate::Cmp {
                field: "amount".to_string(),
                op: CmpOp::Lt,
                value: Scalar::Int(10),
            })
        );
    }

    #[test]
    fn test_limit_cap() {
        let err = SqlParser
            .parse("SELECT * FROM events LIMIT 100000000")
            .unwrap_err();
        assert!(err.message.contains("LIMIT"));
    }

    #[test]
    fn test_parse_error_is_syntax() {
        let err = SqlParser.parse("SELEKT boom").unwrap_err();
        assert_eq!(err.kind, config::meta::query::ParseErrorKind::Syntax);
    }

    #[test]
    fn test_pivot_extension() {
        let select = parse(
            "SELECT * FROM sales PIVOT (sum(amount) FOR region IN ('us', 'eu'))",
        );
        let pivot = select.pivot.unwrap();
        assert_eq!(pivot.column, "region");
        assert_eq!(pivot.value_column, "amount");
        assert_eq!(pivot.values, vec!["us", "eu"]);
        assert_eq!(pivot.aggregate, AggFunc::Sum);
    }

    #[test]
    fn test_match_recognize_extension() {
        let select = parse(
            "SELECT * FROM ticks MATCH_RECOGNIZE (\
             PARTITION BY symbol ORDER BY ts \
             PATTERN (DOWN UP) \
             DEFINE DOWN AS price < 10, UP AS price > 20)",
        );
        let mr = select.match_recognize.unwrap();
        assert_eq!(mr.partition_by, vec!["symbol"]);
        assert_eq!(mr.pattern, "DOWN UP");
        assert_eq!(mr.defines.len(), 2);
        assert_eq!(mr.defines[0].0, "DOWN");
    }

    #[test]
    fn test_model_extension() {
        let select = parse(
            "SELECT * FROM budget MODEL (\
             DIMENSION BY (year) MEASURES (amount) \
             RULES (amount[2025] = amount[2024] * 2))",
        );
        let model = select.model.unwrap();
        assert_eq!(model.dimensions, vec!["year"]);
        assert_eq!(model.measures, vec!["amount"]);
        assert_eq!(model.rules.len(), 1);
    }

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("pre%"), "^pre.*$");
        assert_eq!(like_to_regex("a_c"), "^a.c$");
        assert_eq!(like_to_regex("50%+"), "^50.*\\+$");
    }
}
