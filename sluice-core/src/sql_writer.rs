use crate::{Fields, Filter, IsolationLevel, LockMode, Statement, Value, separated_by};
use std::fmt::Write;

/// Dialect printer converting statements and transaction control into SQL text.
///
/// Every method appends to `out`. The default implementations produce ANSI SQL with
/// PostgreSQL locking clauses, drivers override the pieces their engine spells differently.
pub trait SqlWriter {
    /// Escape occurrences of `search` char with `replace` while copying into buffer.
    fn write_escaped(&self, out: &mut String, value: &str, search: char, replace: &str) {
        let mut position = 0;
        for (i, c) in value.char_indices() {
            if c == search {
                out.push_str(&value[position..i]);
                out.push_str(replace);
                position = i + 1;
            }
        }
        out.push_str(&value[position..]);
    }

    /// Quote identifiers ("name") doubling inner quotes.
    fn write_identifier_quoted(&self, out: &mut String, value: &str) {
        out.push('"');
        self.write_escaped(out, value, '"', "\"\"");
        out.push('"');
    }

    fn write_value(&self, out: &mut String, value: &Value) {
        if value.is_null() {
            out.push_str("NULL");
            return;
        }
        let _ = match value {
            Value::Boolean(Some(v)) => write!(out, "{}", v),
            Value::Int64(Some(v)) => write!(out, "{}", v),
            Value::Float64(Some(v)) if v.is_nan() => write!(out, "'NaN'"),
            Value::Float64(Some(v)) if v.is_infinite() => {
                write!(out, "'{}Infinity'", if *v < 0.0 { "-" } else { "" })
            }
            Value::Float64(Some(v)) => write!(out, "{:?}", v),
            Value::Decimal(Some(v)) => write!(out, "{}", v),
            Value::Varchar(Some(v)) => {
                out.push('\'');
                self.write_escaped(out, v, '\'', "''");
                out.push('\'');
                Ok(())
            }
            Value::Uuid(Some(v)) => write!(out, "'{}'", v),
            Value::Timestamp(Some(v)) => write!(out, "'{}'", v),
            _ => Ok(()),
        };
    }

    /// Emit BEGIN statement.
    fn write_transaction_begin(&self, out: &mut String, isolation: IsolationLevel) {
        out.push_str("BEGIN ISOLATION LEVEL ");
        out.push_str(isolation.sql());
        out.push(';');
    }

    /// Emit COMMIT statement.
    fn write_transaction_commit(&self, out: &mut String) {
        out.push_str("COMMIT;");
    }

    /// Emit ROLLBACK statement.
    fn write_transaction_rollback(&self, out: &mut String) {
        out.push_str("ROLLBACK;");
    }

    fn write_savepoint(&self, out: &mut String, name: &str) {
        out.push_str("SAVEPOINT ");
        self.write_identifier_quoted(out, name);
        out.push(';');
    }

    fn write_release_savepoint(&self, out: &mut String, name: &str) {
        out.push_str("RELEASE SAVEPOINT ");
        self.write_identifier_quoted(out, name);
        out.push(';');
    }

    fn write_rollback_to_savepoint(&self, out: &mut String, name: &str) {
        out.push_str("ROLLBACK TO SAVEPOINT ");
        self.write_identifier_quoted(out, name);
        out.push(';');
    }

    fn write_statement(&self, out: &mut String, statement: &Statement) {
        match statement {
            Statement::Insert { table, id, fields } => self.write_insert(out, table, *id, fields),
            Statement::Select {
                table,
                filter,
                limit,
                lock,
            } => self.write_select(out, table, filter, *limit, *lock),
            Statement::Update {
                table,
                id,
                fields,
                expected_version,
            } => self.write_update(out, table, *id, fields, *expected_version),
            Statement::Delete {
                table,
                id,
                expected_version,
            } => self.write_delete(out, table, *id, *expected_version),
        }
    }

    fn write_insert(&self, out: &mut String, table: &str, id: i64, fields: &Fields) {
        out.push_str("INSERT INTO ");
        self.write_identifier_quoted(out, table);
        out.push_str(" (\"id\", \"version\"");
        for name in fields.keys() {
            out.push_str(", ");
            self.write_identifier_quoted(out, name);
        }
        let _ = write!(out, ") VALUES ({}, 1", id);
        for value in fields.values() {
            out.push_str(", ");
            self.write_value(out, value);
        }
        out.push_str(");");
    }

    fn write_select(
        &self,
        out: &mut String,
        table: &str,
        filter: &Filter,
        limit: Option<u32>,
        lock: Option<LockMode>,
    ) {
        out.push_str("SELECT * FROM ");
        self.write_identifier_quoted(out, table);
        self.write_filter(out, filter);
        out.push_str(" ORDER BY \"id\"");
        if let Some(limit) = limit {
            let _ = write!(out, " LIMIT {}", limit);
        }
        if let Some(lock) = lock {
            self.write_lock_clause(out, lock);
        }
        out.push(';');
    }

    fn write_filter(&self, out: &mut String, filter: &Filter) {
        match filter {
            Filter::All => {}
            Filter::Ids(ids) => {
                out.push_str(" WHERE \"id\" IN (");
                separated_by(
                    out,
                    ids,
                    |out, id| {
                        let _ = write!(out, "{}", id);
                    },
                    ", ",
                );
                out.push(')');
            }
            Filter::Equals(column, value) => {
                out.push_str(" WHERE ");
                self.write_identifier_quoted(out, column);
                if value.is_null() {
                    out.push_str(" IS NULL");
                } else {
                    out.push_str(" = ");
                    self.write_value(out, value);
                }
            }
        }
    }

    fn write_lock_clause(&self, out: &mut String, lock: LockMode) {
        out.push_str(match lock {
            LockMode::Wait => " FOR UPDATE",
            LockMode::NoWait => " FOR UPDATE NOWAIT",
            LockMode::SkipLocked => " FOR UPDATE SKIP LOCKED",
        });
    }

    fn write_update(
        &self,
        out: &mut String,
        table: &str,
        id: i64,
        fields: &Fields,
        expected_version: Option<u64>,
    ) {
        out.push_str("UPDATE ");
        self.write_identifier_quoted(out, table);
        out.push_str(" SET ");
        for (name, value) in fields {
            self.write_identifier_quoted(out, name);
            out.push_str(" = ");
            self.write_value(out, value);
            out.push_str(", ");
        }
        out.push_str("\"version\" = \"version\" + 1");
        let _ = write!(out, " WHERE \"id\" = {}", id);
        if let Some(version) = expected_version {
            let _ = write!(out, " AND \"version\" = {}", version);
        }
        out.push(';');
    }

    fn write_delete(&self, out: &mut String, table: &str, id: i64, expected_version: Option<u64>) {
        out.push_str("DELETE FROM ");
        self.write_identifier_quoted(out, table);
        let _ = write!(out, " WHERE \"id\" = {}", id);
        if let Some(version) = expected_version {
            let _ = write!(out, " AND \"version\" = {}", version);
        }
        out.push(';');
    }
}

/// The default dialect.
#[derive(Default, Debug, Clone, Copy)]
pub struct GenericSqlWriter;

impl SqlWriter for GenericSqlWriter {}
