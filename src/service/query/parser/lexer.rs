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

//! Tokenizer for the NoSQL surface (`db.collection.verb({...})`). Every
//! token carries its line and column; the first bad character aborts.

use config::meta::query::ParseError;

#[derive(Clone, Debug, PartialEq)]
pub enum TokenType {
    Identifier,
    Keyword, // null, true, false
    String,
    Number,
    Punct, // . , : ( ) { } [ ]
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    pub line: u64,
    pub column: u64,
}

pub struct Lexer<'a> {
    input: std::iter::Peekable<std::str::Chars<'a>>,
    line: u64,
    column: u64,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input: input.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.input.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    self.line += 1;
                    self.column = 1;
                }
                '.' | ',' | ':' | '(' | ')' | '{' | '}' | '[' | ']' => {
                    tokens.push(self.token(TokenType::Punct, c.to_string()));
                    self.bump();
                }
                '"' | '\'' => tokens.push(self.string(c)?),
                '-' | '0'..='9' => tokens.push(self.number()?),
                '$' | '_' | 'a'..='z' | 'A'..='Z' => tokens.push(self.identifier()),
                other => {
                    return Err(ParseError::syntax(
                        self.line,
                        self.column,
                        format!("unexpected character: {other}"),
                    )
                    .with_token(other.to_string()));
                }
            }
        }
        Ok(tokens)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.input.next();
        if c.is_some() {
            self.column += 1;
        }
        c
    }

    fn token(&self, token_type: TokenType, value: String) -> Token {
        Token {
            token_type,
            value,
            line: self.line,
            column: self.column,
        }
    }

    fn string(&mut self, quote: char) -> Result<Token, ParseError> {
        let (line, column) = (self.line, self.column);
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(ParseError::syntax(line, column, "unterminated string"));
                }
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('\\') => value.push('\\'),
                    Some('/') => value.push('/'),
                    Some(c) if c == quote => value.push(c),
                    Some('u') => {
                        let mut hex = String::new();
                        for _ in 0..4 {
                            match self.bump() {
                                Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                                _ => {
                                    return Err(ParseError::syntax(
                                        self.line,
                                        self.column,
                                        "invalid unicode escape",
                                    ));
                                }
                            }
                        }
                        let code = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| {
                                ParseError::syntax(
                                    self.line,
                                    self.column,
                                    "invalid unicode escape",
                                )
                            })?;
                        value.push(code);
                    }
                    other => {
                        return Err(ParseError::syntax(
                            self.line,
                            self.column,
                            format!("invalid escape: \\{}", other.unwrap_or(' ')),
                        ));
                    }
                },
                Some('\n') => {
                    return Err(ParseError::syntax(line, column, "unterminated string"));
                }
                Some(c) => value.push(c),
            }
        }
        Ok(Token {
            token_type: TokenType::String,
            value,
            line,
            column,
        })
    }

    fn number(&mut self) -> Result<Token, ParseError> {
        let (line, column) = (self.line, self.column);
        let mut value = String::new();
        if self.input.peek() == Some(&'-') {
            value.push('-');
            self.bump();
        }
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(&c) = self.input.peek() {
            match c {
                '0'..='9' => {
                    value.push(c);
                    self.bump();
                }
                '.' if !seen_dot && !seen_exp => {
                    // lookahead: a dot not followed by a digit belongs to the
                    // caller (method chaining)
                    let mut clone = self.input.clone();
                    clone.next();
                    if !matches!(clone.peek(), Some('0'..='9')) {
                        break;
                    }
                    seen_dot = true;
                    value.push(c);
                    self.bump();
                }
                'e' | 'E' if !seen_exp => {
                    seen_exp = true;
                    value.push(c);
                    self.bump();
                    if matches!(self.input.peek(), Some('-') | Some('+')) {
                        value.push(*self.input.peek().unwrap());
                        self.bump();
                    }
                }
                _ => break,
            }
        }
        if value == "-" || value.is_empty() {
            return Err(ParseError::syntax(line, column, "invalid number"));
        }
        Ok(Token {
            token_type: TokenType::Number,
            value,
            line,
            column,
        })
    }

    fn identifier(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let mut value = String::new();
        while let Some(&c) = self.input.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                value.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let token_type = match value.as_str() {
            "null" | "true" | "false" => TokenType::Keyword,
            _ => TokenType::Identifier,
        };
        Token {
            token_type,
            value,
            line,
            column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_find_call() {
        let tokens = Lexer::new(r#"db.places.find({"lat": -74.5, "ok": true})"#)
            .tokenize()
            .unwrap();
        let values: Vec<&str> = tokens.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(
            values,
            vec![
                "db", ".", "places", ".", "find", "(", "{", "lat", ":", "-74.5", ",", "ok",
                ":", "true", "}", ")",
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("db.x\n  .find()").tokenize().unwrap();
        let find = tokens.iter().find(|t| t.value == "find").unwrap();
        assert_eq!(find.line, 2);
        assert_eq!(find.column, 4);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = Lexer::new(r#""a\nbA""#).tokenize().unwrap();
        assert_eq!(tokens[0].value, "a\nbA");
        assert_eq!(tokens[0].token_type, TokenType::String);
    }

    #[test]
    fn test_bad_character_reports_position() {
        let err = Lexer::new("db.x.find(#)").tokenize().unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 11);
        assert_eq!(err.token.as_deref(), Some("#"));
    }

    #[test]
    fn test_method_chain_dot_not_number() {
        let tokens = Lexer::new("find({}).limit(10)").tokenize().unwrap();
        let values: Vec<&str> = tokens.iter().map(|t| t.value.as_str()).collect();
        assert!(values.contains(&"limit"));
        assert!(values.contains(&"10"));
    }
}
