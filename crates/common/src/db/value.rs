use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};

/// A SQLite value as carried inside replicated updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Named statement arguments, bound to `:name` placeholders.
pub type Args = BTreeMap<String, Value>;

/// Build [`Args`] from `name => value` pairs.
///
/// ```
/// use common::args;
/// let args = args! { "title" => "hello", "stars" => 5 };
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    () => { $crate::db::Args::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut args = $crate::db::Args::new();
        $(args.insert($name.to_string(), $crate::db::Value::from($value));)+
        args
    }};
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn bind<'q>(
        &self,
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Blob(b) => query.bind(b.clone()),
        }
    }

    /// Read column `index` by its runtime storage class.
    pub(crate) fn from_row(row: &SqliteRow, index: usize) -> Result<Self, sqlx::Error> {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let type_name = raw.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "BOOLEAN" => Value::Integer(row.try_get(index)?),
            "REAL" | "FLOAT" | "DOUBLE" => Value::Real(row.try_get(index)?),
            "BLOB" => Value::Blob(row.try_get(index)?),
            _ => Value::Text(row.try_get(index)?),
        };
        Ok(value)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_args_macro() {
        let args = crate::args! {
            "title" => "hello",
            "stars" => 5,
            "score" => 0.5,
            "note" => None::<String>,
        };
        assert_eq!(args["title"], Value::Text("hello".into()));
        assert_eq!(args["stars"].as_i64(), Some(5));
        assert_eq!(args["score"].as_f64(), Some(0.5));
        assert!(args["note"].is_null());
        assert!(crate::args! {}.is_empty());
    }

    #[tokio::test]
    async fn test_values_roundtrip_through_sqlite() {
        let pool = crate::sqlite::connect(None).await.unwrap();
        let values = vec![
            Value::Null,
            Value::Integer(-7),
            Value::Real(1.25),
            Value::Text("text".into()),
            Value::Blob(vec![0, 1, 2]),
        ];
        let mut query = sqlx::query("SELECT ?, ?, ?, ?, ?");
        for value in &values {
            query = value.bind(query);
        }
        let row = query.fetch_one(&pool).await.unwrap();
        let read: Vec<Value> = (0..values.len())
            .map(|i| Value::from_row(&row, i).unwrap())
            .collect();
        assert_eq!(read, values);
    }
}
