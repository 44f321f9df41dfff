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

//! Dialect registry. Parsers lower their dialect to the common AST; the
//! registry is populated once at startup and read-only afterwards.

pub mod lexer;
pub mod nosql;
pub mod sql;

use std::sync::Arc;

use config::{
    RwHashMap,
    meta::query::{Dialect, ParseError, QueryAst},
};
use infra::errors::{Error, ErrorCodes};
use once_cell::sync::Lazy;

pub trait DialectParser: Send + Sync {
    fn dialect(&self) -> Dialect;
    fn parse(&self, query: &str) -> Result<QueryAst, ParseError>;
}

static REGISTRY: Lazy<RwHashMap<Dialect, Arc<dyn DialectParser>>> = Lazy::new(Default::default);

pub fn init() {
    REGISTRY.insert(Dialect::Sql, Arc::new(sql::SqlParser));
    REGISTRY.insert(Dialect::Nosql, Arc::new(nosql::NosqlParser));
}

pub fn parse(dialect: Dialect, query: &str) -> Result<QueryAst, Error> {
    if REGISTRY.is_empty() {
        init();
    }
    let parser = REGISTRY
        .get(&dialect)
        .map(|p| p.clone())
        .ok_or_else(|| Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
            "no parser for dialect {dialect:?}"
        ))))?;
    parser
        .parse(query)
        .map_err(|e| Error::ErrorCode(ErrorCodes::QueryParseError(e.to_string())))
}

/// parse keeping the positional error, used by the http surface
pub fn parse_with_positions(dialect: Dialect, query: &str) -> Result<QueryAst, ParseError> {
    if REGISTRY.is_empty() {
        init();
    }
    let parser = REGISTRY
        .get(&dialect)
        .map(|p| p.clone())
        .ok_or_else(|| ParseError::validation(format!("no parser for dialect {dialect:?}")))?;
    parser.parse(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        init();
        let ast = parse(Dialect::Sql, "SELECT user_id FROM events LIMIT 5").unwrap();
        assert_eq!(ast.dialect, Dialect::Sql);
        let ast = parse(Dialect::Nosql, r#"db.events.find({})"#).unwrap();
        assert_eq!(ast.dialect, Dialect::Nosql);
    }
}
