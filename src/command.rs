//! # Request Parsing
//!
//! Maps a raw request string onto the [`Command`] sum type. The grammar is a
//! small semicolon-terminated command language:
//!
//! ```text
//! select [into iterator] [with taints ["t", ...]] [with datasets ["d", ...]] "literal" ;
//! iterator "<id>" pop <count> ;
//! index "path" ["path" ...] [with [gram3, text4]] [with taints [...]] [nocheck] ;
//! index from list "path-file" [with [...]] [with taints [...]] [nocheck] ;
//! reindex "dataset-id" [with [gram3]] ;
//! compact smart ;  |  compact all ;
//! status ;  |  topology ;  |  ping ;
//! config get [key ...] ;  |  config set <key> <value> ;
//! taint "dataset-id" add "label" ;  |  taint "dataset-id" remove "label" ;
//! drop "dataset-id" ;
//! ```
//!
//! Parsing failures are recoverable ([`Error::BadRequest`]): safe dispatch
//! turns them into error responses and the worker moves on.
//!
//! `Command` is a closed enum on purpose: executor dispatch and the lock
//! planner both match on it exhaustively, so adding a variant refuses to
//! compile until every consumer handles it.

use crate::error::{Error, Result};
use crate::types::{CompactMode, DatasetId, IndexType, IteratorId, TaintMode};

/// Index types applied when a request does not name any.
pub const DEFAULT_INDEX_TYPES: &[IndexType] = &[IndexType::Gram3];

// =============================================================================
// Query
// =============================================================================

/// An opaque query handed to the query engine.
///
/// The dispatch layer never interprets it beyond carrying it to
/// `DatabaseSnapshot::execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query(String);

impl Query {
    /// Wraps a query literal.
    pub fn literal(needle: impl Into<String>) -> Self {
        Self(needle.into())
    }

    /// The raw needle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Commands
// =============================================================================

/// One parsed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Select {
        query: Query,
        taints: Vec<String>,
        datasets: Vec<DatasetId>,
        iterator_requested: bool,
    },
    IteratorPop {
        iterator_id: IteratorId,
        count: u64,
    },
    Index {
        paths: Vec<String>,
        index_types: Vec<IndexType>,
        taints: Vec<String>,
        ensure_unique: bool,
    },
    IndexFrom {
        path_list_file: String,
        index_types: Vec<IndexType>,
        taints: Vec<String>,
        ensure_unique: bool,
    },
    Reindex {
        dataset_id: DatasetId,
        index_types: Vec<IndexType>,
    },
    Compact {
        mode: CompactMode,
    },
    Status,
    Topology,
    Ping,
    ConfigGet {
        keys: Vec<String>,
    },
    ConfigSet {
        key: String,
        value: u64,
    },
    Taint {
        dataset: DatasetId,
        taint: String,
        mode: TaintMode,
    },
    DatasetDrop {
        dataset_id: DatasetId,
    },
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(u64),
    LBracket,
    RBracket,
    Comma,
    Semicolon,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(Error::BadRequest(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = digits
                    .parse::<u64>()
                    .map_err(|_| Error::BadRequest(format!("number out of range: {}", digits)))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c => {
                return Err(Error::BadRequest(format!("unexpected character '{}'", c)));
            }
        }
    }

    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| Error::BadRequest("unexpected end of request".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(word) => Ok(word),
            other => Err(Error::BadRequest(format!(
                "expected a word, got {:?}",
                other
            ))),
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        let got = self.expect_ident()?;
        if got != word {
            return Err(Error::BadRequest(format!(
                "expected '{}', got '{}'",
                word, got
            )));
        }
        Ok(())
    }

    fn expect_str(&mut self) -> Result<String> {
        match self.next()? {
            Token::Str(s) => Ok(s),
            other => Err(Error::BadRequest(format!(
                "expected a quoted string, got {:?}",
                other
            ))),
        }
    }

    fn expect_num(&mut self) -> Result<u64> {
        match self.next()? {
            Token::Num(n) => Ok(n),
            other => Err(Error::BadRequest(format!(
                "expected a number, got {:?}",
                other
            ))),
        }
    }

    fn expect_semicolon(&mut self) -> Result<()> {
        match self.next()? {
            Token::Semicolon => Ok(()),
            other => Err(Error::BadRequest(format!(
                "expected ';', got {:?}",
                other
            ))),
        }
    }

    /// After the final `;` nothing may follow.
    fn expect_end(&mut self) -> Result<()> {
        if let Some(extra) = self.peek() {
            return Err(Error::BadRequest(format!(
                "trailing input after ';': {:?}",
                extra
            )));
        }
        Ok(())
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    /// `[ "a", "b" ]`: a bracketed, comma-separated list of strings.
    fn parse_str_list(&mut self) -> Result<Vec<String>> {
        match self.next()? {
            Token::LBracket => {}
            other => {
                return Err(Error::BadRequest(format!(
                    "expected '[', got {:?}",
                    other
                )))
            }
        }
        let mut items = Vec::new();
        if matches!(self.peek(), Some(Token::RBracket)) {
            self.next()?;
            return Ok(items);
        }
        loop {
            items.push(self.expect_str()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RBracket => break,
                other => {
                    return Err(Error::BadRequest(format!(
                        "expected ',' or ']', got {:?}",
                        other
                    )))
                }
            }
        }
        Ok(items)
    }

    /// `[ gram3, text4 ]`: a bracketed list of index type names.
    fn parse_index_types(&mut self) -> Result<Vec<IndexType>> {
        match self.next()? {
            Token::LBracket => {}
            other => {
                return Err(Error::BadRequest(format!(
                    "expected '[', got {:?}",
                    other
                )))
            }
        }
        let mut types = Vec::new();
        if matches!(self.peek(), Some(Token::RBracket)) {
            self.next()?;
            return Ok(types);
        }
        loop {
            let name = self.expect_ident()?;
            let ty = IndexType::parse(&name)
                .ok_or_else(|| Error::BadRequest(format!("unknown index type '{}'", name)))?;
            types.push(ty);
            match self.next()? {
                Token::Comma => continue,
                Token::RBracket => break,
                other => {
                    return Err(Error::BadRequest(format!(
                        "expected ',' or ']', got {:?}",
                        other
                    )))
                }
            }
        }
        Ok(types)
    }
}

// =============================================================================
// Entry Point
// =============================================================================

/// Parses a request string into a [`Command`].
pub fn parse_command(input: &str) -> Result<Command> {
    let mut parser = Parser::new(tokenize(input)?);

    let head = parser.expect_ident()?;
    let command = match head.as_str() {
        "select" => parse_select(&mut parser)?,
        "iterator" => parse_iterator_pop(&mut parser)?,
        "index" => parse_index(&mut parser)?,
        "reindex" => parse_reindex(&mut parser)?,
        "compact" => parse_compact(&mut parser)?,
        "status" => {
            parser.expect_semicolon()?;
            Command::Status
        }
        "topology" => {
            parser.expect_semicolon()?;
            Command::Topology
        }
        "ping" => {
            parser.expect_semicolon()?;
            Command::Ping
        }
        "config" => parse_config(&mut parser)?,
        "taint" => parse_taint(&mut parser)?,
        "drop" => {
            let dataset_id = DatasetId::new(parser.expect_str()?);
            parser.expect_semicolon()?;
            Command::DatasetDrop { dataset_id }
        }
        other => {
            return Err(Error::BadRequest(format!("unknown command '{}'", other)));
        }
    };
    parser.expect_end()?;
    Ok(command)
}

fn parse_select(parser: &mut Parser) -> Result<Command> {
    let mut iterator_requested = false;
    let mut taints = Vec::new();
    let mut datasets = Vec::new();

    if parser.at_keyword("into") {
        parser.next()?;
        parser.expect_keyword("iterator")?;
        iterator_requested = true;
    }

    while parser.at_keyword("with") {
        parser.next()?;
        if parser.at_keyword("taints") {
            parser.next()?;
            taints = parser.parse_str_list()?;
        } else if parser.at_keyword("datasets") {
            parser.next()?;
            datasets = parser
                .parse_str_list()?
                .into_iter()
                .map(DatasetId::new)
                .collect();
        } else {
            return Err(Error::BadRequest(
                "expected 'taints' or 'datasets' after 'with'".to_string(),
            ));
        }
    }

    let query = Query::literal(parser.expect_str()?);
    parser.expect_semicolon()?;

    Ok(Command::Select {
        query,
        taints,
        datasets,
        iterator_requested,
    })
}

fn parse_iterator_pop(parser: &mut Parser) -> Result<Command> {
    let iterator_id = IteratorId::new(parser.expect_str()?);
    parser.expect_keyword("pop")?;
    let count = parser.expect_num()?;
    parser.expect_semicolon()?;
    Ok(Command::IteratorPop { iterator_id, count })
}

/// Shared tail of `index` and `index from list`: optional `with` clauses and
/// the `nocheck` flag.
fn parse_index_options(parser: &mut Parser) -> Result<(Vec<IndexType>, Vec<String>, bool)> {
    let mut index_types = Vec::new();
    let mut taints = Vec::new();

    while parser.at_keyword("with") {
        parser.next()?;
        if parser.at_keyword("taints") {
            parser.next()?;
            taints = parser.parse_str_list()?;
        } else {
            index_types = parser.parse_index_types()?;
        }
    }

    let mut ensure_unique = true;
    if parser.at_keyword("nocheck") {
        parser.next()?;
        ensure_unique = false;
    }

    if index_types.is_empty() {
        index_types = DEFAULT_INDEX_TYPES.to_vec();
    }

    parser.expect_semicolon()?;
    Ok((index_types, taints, ensure_unique))
}

fn parse_index(parser: &mut Parser) -> Result<Command> {
    if parser.at_keyword("from") {
        parser.next()?;
        parser.expect_keyword("list")?;
        let path_list_file = parser.expect_str()?;
        let (index_types, taints, ensure_unique) = parse_index_options(parser)?;
        return Ok(Command::IndexFrom {
            path_list_file,
            index_types,
            taints,
            ensure_unique,
        });
    }

    let mut paths = vec![parser.expect_str()?];
    while matches!(parser.peek(), Some(Token::Str(_))) {
        paths.push(parser.expect_str()?);
    }

    let (index_types, taints, ensure_unique) = parse_index_options(parser)?;
    Ok(Command::Index {
        paths,
        index_types,
        taints,
        ensure_unique,
    })
}

fn parse_reindex(parser: &mut Parser) -> Result<Command> {
    let dataset_id = DatasetId::new(parser.expect_str()?);
    let mut index_types = Vec::new();
    if parser.at_keyword("with") {
        parser.next()?;
        index_types = parser.parse_index_types()?;
    }
    if index_types.is_empty() {
        index_types = DEFAULT_INDEX_TYPES.to_vec();
    }
    parser.expect_semicolon()?;
    Ok(Command::Reindex {
        dataset_id,
        index_types,
    })
}

fn parse_compact(parser: &mut Parser) -> Result<Command> {
    let mode = match parser.expect_ident()?.as_str() {
        "smart" => CompactMode::Smart,
        "all" => CompactMode::Full,
        other => {
            return Err(Error::BadRequest(format!(
                "expected 'smart' or 'all', got '{}'",
                other
            )))
        }
    };
    parser.expect_semicolon()?;
    Ok(Command::Compact { mode })
}

fn parse_config(parser: &mut Parser) -> Result<Command> {
    match parser.expect_ident()?.as_str() {
        "get" => {
            let mut keys = Vec::new();
            loop {
                match parser.next()? {
                    Token::Semicolon => break,
                    Token::Ident(key) => keys.push(key),
                    Token::Str(key) => keys.push(key),
                    other => {
                        return Err(Error::BadRequest(format!(
                            "expected a key name or ';', got {:?}",
                            other
                        )))
                    }
                }
            }
            Ok(Command::ConfigGet { keys })
        }
        "set" => {
            let key = parser.expect_ident()?;
            let value = parser.expect_num()?;
            parser.expect_semicolon()?;
            Ok(Command::ConfigSet { key, value })
        }
        other => Err(Error::BadRequest(format!(
            "expected 'get' or 'set', got '{}'",
            other
        ))),
    }
}

fn parse_taint(parser: &mut Parser) -> Result<Command> {
    let dataset = DatasetId::new(parser.expect_str()?);
    let mode = match parser.expect_ident()?.as_str() {
        "add" => TaintMode::Add,
        "remove" => TaintMode::Remove,
        other => {
            return Err(Error::BadRequest(format!(
                "expected 'add' or 'remove', got '{}'",
                other
            )))
        }
    };
    let taint = parser.expect_str()?;
    parser.expect_semicolon()?;
    Ok(Command::Taint {
        dataset,
        taint,
        mode,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select_simple() {
        let cmd = parse_command("select \"hello\";").unwrap();
        assert_eq!(
            cmd,
            Command::Select {
                query: Query::literal("hello"),
                taints: vec![],
                datasets: vec![],
                iterator_requested: false,
            }
        );
    }

    #[test]
    fn test_parse_select_into_iterator_with_filters() {
        let cmd = parse_command(
            "select into iterator with taints [\"evil\"] with datasets [\"set_1\", \"set_2\"] \"xor\";",
        )
        .unwrap();
        match cmd {
            Command::Select {
                query,
                taints,
                datasets,
                iterator_requested,
            } => {
                assert_eq!(query.as_str(), "xor");
                assert_eq!(taints, vec!["evil"]);
                assert_eq!(datasets, vec![DatasetId::new("set_1"), DatasetId::new("set_2")]);
                assert!(iterator_requested);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_iterator_pop() {
        let cmd = parse_command("iterator \"ab12\" pop 2;").unwrap();
        assert_eq!(
            cmd,
            Command::IteratorPop {
                iterator_id: IteratorId::new("ab12"),
                count: 2,
            }
        );
    }

    #[test]
    fn test_parse_index_defaults() {
        let cmd = parse_command("index \"/mnt/samples\";").unwrap();
        match cmd {
            Command::Index {
                paths,
                index_types,
                taints,
                ensure_unique,
            } => {
                assert_eq!(paths, vec!["/mnt/samples"]);
                assert_eq!(index_types, vec![IndexType::Gram3]);
                assert!(taints.is_empty());
                assert!(ensure_unique);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_full_form() {
        let cmd = parse_command(
            "index \"a.bin\" \"b.bin\" with [gram3, text4] with taints [\"fresh\"] nocheck;",
        )
        .unwrap();
        match cmd {
            Command::Index {
                paths,
                index_types,
                taints,
                ensure_unique,
            } => {
                assert_eq!(paths, vec!["a.bin", "b.bin"]);
                assert_eq!(index_types, vec![IndexType::Gram3, IndexType::Text4]);
                assert_eq!(taints, vec!["fresh"]);
                assert!(!ensure_unique);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_from_list() {
        let cmd = parse_command("index from list \"/tmp/paths.txt\" with [hash4];").unwrap();
        match cmd {
            Command::IndexFrom {
                path_list_file,
                index_types,
                ensure_unique,
                ..
            } => {
                assert_eq!(path_list_file, "/tmp/paths.txt");
                assert_eq!(index_types, vec![IndexType::Hash4]);
                assert!(ensure_unique);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_reindex_compact() {
        assert_eq!(
            parse_command("reindex \"set_9\" with [wide8];").unwrap(),
            Command::Reindex {
                dataset_id: DatasetId::new("set_9"),
                index_types: vec![IndexType::Wide8],
            }
        );
        assert_eq!(
            parse_command("compact smart;").unwrap(),
            Command::Compact {
                mode: CompactMode::Smart
            }
        );
        assert_eq!(
            parse_command("compact all;").unwrap(),
            Command::Compact {
                mode: CompactMode::Full
            }
        );
    }

    #[test]
    fn test_parse_bare_commands() {
        assert_eq!(parse_command("status;").unwrap(), Command::Status);
        assert_eq!(parse_command("topology;").unwrap(), Command::Topology);
        assert_eq!(parse_command("ping;").unwrap(), Command::Ping);
    }

    #[test]
    fn test_parse_config() {
        assert_eq!(
            parse_command("config get;").unwrap(),
            Command::ConfigGet { keys: vec![] }
        );
        assert_eq!(
            parse_command("config get max_mem database_workers;").unwrap(),
            Command::ConfigGet {
                keys: vec!["max_mem".to_string(), "database_workers".to_string()]
            }
        );
        assert_eq!(
            parse_command("config set max_mem 99999999999999;").unwrap(),
            Command::ConfigSet {
                key: "max_mem".to_string(),
                value: 99_999_999_999_999,
            }
        );
    }

    #[test]
    fn test_parse_taint_and_drop() {
        assert_eq!(
            parse_command("taint \"set_1\" add \"evil\";").unwrap(),
            Command::Taint {
                dataset: DatasetId::new("set_1"),
                taint: "evil".to_string(),
                mode: TaintMode::Add,
            }
        );
        assert_eq!(
            parse_command("taint \"set_1\" remove \"evil\";").unwrap(),
            Command::Taint {
                dataset: DatasetId::new("set_1"),
                taint: "evil".to_string(),
                mode: TaintMode::Remove,
            }
        );
        assert_eq!(
            parse_command("drop \"set_1\";").unwrap(),
            Command::DatasetDrop {
                dataset_id: DatasetId::new("set_1")
            }
        );
    }

    #[test]
    fn test_parse_failures_are_recoverable() {
        for bad in [
            "",
            "selec \"x\";",
            "select \"x\"",
            "select \"x;",
            "select x;",
            "index;",
            "index \"a\" with [gram4];",
            "iterator \"i\" pop;",
            "compact sideways;",
            "config frobnicate;",
            "taint \"a\" toggle \"b\";",
            "status; status;",
            "ping; trailing",
        ] {
            let err = parse_command(bad).unwrap_err();
            assert!(
                matches!(err, Error::BadRequest(_)),
                "input {:?} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_number_overflow_rejected() {
        let err = parse_command("iterator \"i\" pop 99999999999999999999999999;").unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
