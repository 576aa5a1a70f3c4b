//! Named, versioned SQL statements.
//!
//! A definition is plain SQL where each statement is introduced by a
//! `-- KEY` comment line and ends at the next blank line:
//!
//! ```sql
//! -- INIT
//! CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, title TEXT)
//!
//! -- INSERT_NOTE
//! INSERT INTO notes (title) VALUES (:title)
//! ```
//!
//! `INIT` statements run when defined. Every other statement is stored under
//! its key and referenced by that key in updates, so peers replay the same
//! statement rather than shipping SQL around.

use std::collections::HashMap;

use super::error::DatabaseError;
use super::value::Args;

pub const INIT_KEY: &str = "INIT";

/// A statement ready to bind: `:name` placeholders turned into `?`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub key: String,
    pub version: f32,
    /// The SQL as defined
    pub source: String,
    /// The SQL handed to SQLite
    pub sql: String,
    /// Argument name of each `?`, in order
    pub params: Vec<String>,
}

impl Statement {
    pub fn new(key: &str, version: f32, source: &str) -> Self {
        let (sql, params) = rewrite_params(source);
        Self {
            key: key.to_string(),
            version,
            source: source.to_string(),
            sql,
            params,
        }
    }

    /// Bind `args` in placeholder order.
    pub(crate) fn query<'q>(
        &'q self,
        args: &Args,
    ) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, DatabaseError>
    {
        let mut query = sqlx::query(&self.sql);
        for name in &self.params {
            let value = args.get(name).ok_or_else(|| DatabaseError::MissingArgument {
                key: self.key.clone(),
                name: name.clone(),
            })?;
            query = value.bind(query);
        }
        Ok(query)
    }
}

/// Split a definition into `(key, sql)` pairs in order of appearance.
pub fn parse(ddl: &str) -> Result<Vec<(String, String)>, DatabaseError> {
    let mut statements = Vec::new();
    let mut key: Option<String> = None;
    let mut body = String::new();

    // Each key heads exactly one statement
    let mut finish = |key: &mut Option<String>, body: &mut String| -> Result<(), DatabaseError> {
        if body.trim().is_empty() {
            body.clear();
            return Ok(());
        }
        let key = key
            .take()
            .ok_or_else(|| DatabaseError::Definition(format!("statement without key: {}", body.trim())))?;
        statements.push((key, body.trim().to_string()));
        body.clear();
        Ok(())
    };

    for line in ddl.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            finish(&mut key, &mut body)?;
        } else if let Some(header) = trimmed.strip_prefix("--") {
            if body.trim().is_empty() {
                let header = header.trim();
                if !header.is_empty() {
                    key = Some(header.to_string());
                }
            }
            // Comments inside a statement are left out
        } else {
            body.push_str(trimmed);
            body.push('\n');
        }
    }
    finish(&mut key, &mut body)?;
    Ok(statements)
}

/// Replace `:name` placeholders outside quotes with `?`.
fn rewrite_params(source: &str) -> (String, Vec<String>) {
    let mut sql = String::with_capacity(source.len());
    let mut params = Vec::new();
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        let after_word = prev.is_some_and(|p| p == ':' || p.is_ascii_alphanumeric());
        prev = Some(c);
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                sql.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                sql.push(c);
            }
            None if c == ':'
                && !after_word
                && chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') =>
            {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        prev = Some(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                sql.push('?');
                params.push(name);
            }
            None => sql.push(c),
        }
    }
    (sql, params)
}

/// The statements a database knows, by key.
#[derive(Debug, Default)]
pub(crate) struct Statements(HashMap<String, Statement>);

impl Statements {
    pub fn get(&self, key: &str) -> Option<&Statement> {
        self.0.get(key)
    }

    /// Register a statement. Returns `false` when an equal or newer one is
    /// already known.
    pub fn define(&mut self, key: &str, version: f32, source: &str) -> Result<bool, DatabaseError> {
        let statement = Statement::new(key, version, source);
        if let Some(existing) = self.0.get(key) {
            if existing.version > version {
                return Ok(false);
            }
            if existing.version == version {
                if existing.source != statement.source {
                    return Err(DatabaseError::DuplicateStatement {
                        key: key.to_string(),
                        version,
                    });
                }
                return Ok(false);
            }
        }
        self.0.insert(key.to_string(), statement);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
