use crate::{AsValue, GenericSqlWriter, LockMode, Result, SessionError, SqlWriter, Value};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

/// Column name to value map of a row, ordered by column name.
pub type Fields = BTreeMap<String, Value>;

/// Identity of a row: table name and integer primary key.
///
/// The derived ordering (table, then id) is the global lock order: callers that lock more than
/// one row acquire them in ascending `EntityKey` order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub table: Cow<'static, str>,
    pub id: i64,
}

impl EntityKey {
    pub fn new(table: impl Into<Cow<'static, str>>, id: i64) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

/// A stored row together with its version counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: EntityKey,
    pub version: u64,
    pub fields: Fields,
}

impl Record {
    pub fn id(&self) -> i64 {
        self.key.id
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Decode a column, a missing column decodes like NULL.
    pub fn get<T: AsValue>(&self, column: &str) -> Result<T> {
        T::try_from_value(self.fields.get(column).cloned().unwrap_or_default()).map_err(|e| {
            match e {
                SessionError::Decode { expected, found } => SessionError::Decode {
                    expected,
                    found: format!("{} in column `{}` of {}", found, column, self.key),
                },
                e => e,
            }
        })
    }
}

/// Row selection of a `SELECT`.
#[derive(Default, Debug, Clone, PartialEq)]
pub enum Filter {
    #[default]
    All,
    Ids(Vec<i64>),
    Equals(String, Value),
}

impl Filter {
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Equals(column.into(), value.into())
    }

    pub fn matches(&self, id: i64, fields: &Fields) -> bool {
        match self {
            Filter::All => true,
            Filter::Ids(ids) => ids.contains(&id),
            Filter::Equals(column, value) if column == "id" => *value == Value::Int64(Some(id)),
            Filter::Equals(column, value) => fields.get(column).is_some_and(|v| v == value),
        }
    }
}

/// One unit of work handed to a driver connection.
///
/// Every write increments the row version by exactly one. `expected_version` turns an update or
/// delete into a compare-and-swap that affects zero rows when the stored version differs.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert {
        table: Cow<'static, str>,
        id: i64,
        fields: Fields,
    },
    Select {
        table: Cow<'static, str>,
        filter: Filter,
        limit: Option<u32>,
        lock: Option<LockMode>,
    },
    Update {
        table: Cow<'static, str>,
        id: i64,
        fields: Fields,
        expected_version: Option<u64>,
    },
    Delete {
        table: Cow<'static, str>,
        id: i64,
        expected_version: Option<u64>,
    },
}

impl Statement {
    pub fn insert(table: impl Into<Cow<'static, str>>, id: i64, fields: Fields) -> Self {
        Statement::Insert {
            table: table.into(),
            id,
            fields,
        }
    }

    pub fn select(table: impl Into<Cow<'static, str>>) -> Self {
        Statement::Select {
            table: table.into(),
            filter: Filter::All,
            limit: None,
            lock: None,
        }
    }

    pub fn update(table: impl Into<Cow<'static, str>>, id: i64, fields: Fields) -> Self {
        Statement::Update {
            table: table.into(),
            id,
            fields,
            expected_version: None,
        }
    }

    pub fn delete(table: impl Into<Cow<'static, str>>, id: i64) -> Self {
        Statement::Delete {
            table: table.into(),
            id,
            expected_version: None,
        }
    }

    /// Restrict a `SELECT`, no effect on other statements.
    pub fn filter(mut self, value: Filter) -> Self {
        if let Statement::Select { filter, .. } = &mut self {
            *filter = value;
        }
        self
    }

    pub fn limit(mut self, value: u32) -> Self {
        if let Statement::Select { limit, .. } = &mut self {
            *limit = Some(value);
        }
        self
    }

    /// `SELECT ... FOR UPDATE` with the given lock mode.
    pub fn for_update(mut self, mode: LockMode) -> Self {
        if let Statement::Select { lock, .. } = &mut self {
            *lock = Some(mode);
        }
        self
    }

    /// Make an `UPDATE` or `DELETE` conditional on the stored version.
    pub fn if_version(mut self, version: u64) -> Self {
        match &mut self {
            Statement::Update {
                expected_version, ..
            }
            | Statement::Delete {
                expected_version, ..
            } => *expected_version = Some(version),
            _ => {}
        }
        self
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Select { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => &**table,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select { .. })
    }

    /// Row targeted by an `INSERT`, `UPDATE` or `DELETE`.
    pub fn written_key(&self) -> Option<EntityKey> {
        match self {
            Statement::Insert { table, id, .. }
            | Statement::Update { table, id, .. }
            | Statement::Delete { table, id, .. } => Some(EntityKey::new(table.clone(), *id)),
            Statement::Select { .. } => None,
        }
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        GenericSqlWriter.write_statement(&mut out, self);
        f.write_str(&out)
    }
}

/// Result of a statement: returned rows (`RETURNING` semantics for writes) and the count of
/// rows touched.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct RowSet {
    pub rows: Vec<Record>,
    pub rows_affected: u64,
}

impl RowSet {
    pub fn affected(rows: Vec<Record>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(self) -> Option<Record> {
        self.rows.into_iter().next()
    }
}

impl IntoIterator for RowSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
