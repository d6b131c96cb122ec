#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rust_decimal::Decimal;
    use sluice::{
        AsValue, Fields, Filter, GenericSqlWriter, IsolationLevel, LockMode, SqlWriter, Statement,
        Value,
    };

    const WRITER: GenericSqlWriter = GenericSqlWriter;

    fn sql(statement: &Statement) -> String {
        let mut out = String::new();
        WRITER.write_statement(&mut out, statement);
        out
    }

    #[test]
    fn insert_and_update() {
        let fields = Fields::from([
            ("owner".into(), Value::from("O'Brien")),
            ("balance".into(), Decimal::new(10050, 2).as_value()),
            ("closed".into(), Value::Boolean(None)),
        ]);
        assert_eq!(
            sql(&Statement::insert("accounts", 7, fields.clone())),
            r#"INSERT INTO "accounts" ("id", "version", "balance", "closed", "owner") VALUES (7, 1, 100.50, NULL, 'O''Brien');"#
        );
        assert_eq!(
            sql(&Statement::update("accounts", 7, fields).if_version(3)),
            indoc! {r#"
                UPDATE "accounts" SET "balance" = 100.50, "closed" = NULL, "owner" = 'O''Brien', "version" = "version" + 1 WHERE "id" = 7 AND "version" = 3;
            "#}
            .trim()
        );
        assert_eq!(
            sql(&Statement::update("counters", 1, Fields::new())),
            r#"UPDATE "counters" SET "version" = "version" + 1 WHERE "id" = 1;"#
        );
    }

    #[test]
    fn select_and_lock() {
        assert_eq!(
            sql(&Statement::select("accounts")),
            r#"SELECT * FROM "accounts" ORDER BY "id";"#
        );
        assert_eq!(
            sql(&Statement::select("accounts")
                .filter(Filter::Ids(vec![1, 2, 3]))
                .for_update(LockMode::Wait)),
            r#"SELECT * FROM "accounts" WHERE "id" IN (1, 2, 3) ORDER BY "id" FOR UPDATE;"#
        );
        assert_eq!(
            sql(&Statement::select("jobs")
                .filter(Filter::equals("status", "pending"))
                .limit(2)
                .for_update(LockMode::SkipLocked)),
            r#"SELECT * FROM "jobs" WHERE "status" = 'pending' ORDER BY "id" LIMIT 2 FOR UPDATE SKIP LOCKED;"#
        );
        assert_eq!(
            sql(&Statement::select("jobs")
                .filter(Filter::equals("owner", Value::Varchar(None)))
                .for_update(LockMode::NoWait)),
            r#"SELECT * FROM "jobs" WHERE "owner" IS NULL ORDER BY "id" FOR UPDATE NOWAIT;"#
        );
    }

    #[test]
    fn delete() {
        assert_eq!(
            sql(&Statement::delete("accounts", 9)),
            r#"DELETE FROM "accounts" WHERE "id" = 9;"#
        );
        assert_eq!(
            Statement::delete("odd \"table\"", 9).if_version(2).to_string(),
            r#"DELETE FROM "odd ""table""" WHERE "id" = 9 AND "version" = 2;"#
        );
    }

    #[test]
    fn transaction_control() {
        let mut out = String::new();
        WRITER.write_transaction_begin(&mut out, IsolationLevel::Serializable);
        out.push('\n');
        WRITER.write_savepoint(&mut out, "sp_1");
        out.push('\n');
        WRITER.write_rollback_to_savepoint(&mut out, "sp_1");
        out.push('\n');
        WRITER.write_release_savepoint(&mut out, "sp_1");
        out.push('\n');
        WRITER.write_transaction_rollback(&mut out);
        out.push('\n');
        WRITER.write_transaction_begin(&mut out, IsolationLevel::ReadCommitted);
        out.push('\n');
        WRITER.write_transaction_commit(&mut out);
        assert_eq!(
            out,
            indoc! {r#"
                BEGIN ISOLATION LEVEL SERIALIZABLE;
                SAVEPOINT "sp_1";
                ROLLBACK TO SAVEPOINT "sp_1";
                RELEASE SAVEPOINT "sp_1";
                ROLLBACK;
                BEGIN ISOLATION LEVEL READ COMMITTED;
                COMMIT;
            "#}
            .trim()
        );
    }

    #[test]
    fn values() {
        let cases = [
            (Value::Null, "NULL"),
            (true.as_value(), "true"),
            ((-12_i64).as_value(), "-12"),
            (1.5_f64.as_value(), "1.5"),
            (f64::NAN.as_value(), "'NaN'"),
            (f64::NEG_INFINITY.as_value(), "'-Infinity'"),
            (Value::from("it's"), "'it''s'"),
        ];
        for (value, expected) in cases {
            let mut out = String::new();
            WRITER.write_value(&mut out, &value);
            assert_eq!(out, expected);
        }
    }
}
