#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use sluice::{AsValue, EntityKey, ErrorKind, Fields, Filter, Record, SessionError, Value};
    use std::str::FromStr;
    use time::macros::datetime;
    use uuid::Uuid;

    #[test]
    fn value_null() {
        assert_eq!(Value::Null, Value::Null);
        assert_eq!(Value::Int64(None), Value::Null);
        assert_eq!(Value::Varchar(None), Value::Boolean(None));
        assert_ne!(Value::Int64(Some(0)), Value::Null);
        assert!(Option::<i64>::None.as_value().is_null());
        assert!(Value::Int64(None).same_type(&i64::as_empty_value()));
        assert!(!Value::Int64(None).same_type(&Value::Varchar(None)));
    }

    #[test]
    fn value_bool() {
        let val = true.as_value();
        assert_eq!(val, Value::Boolean(Some(true)));
        assert_ne!(val, Value::Varchar(Some("true".into())));
        assert_eq!(bool::try_from_value(val).unwrap(), true);
        assert_eq!(bool::try_from_value(0_i64.as_value()).unwrap(), false);
        assert_eq!(bool::try_from_value(7_i32.as_value()).unwrap(), true);
        assert!(bool::try_from_value(Value::from("true")).is_err());
    }

    #[test]
    fn value_integers() {
        assert_eq!(42_i32.as_value(), Value::Int64(Some(42)));
        assert_eq!(i32::try_from_value(Value::Int64(Some(-7))).unwrap(), -7);
        assert!(i32::try_from_value(Value::Int64(Some(i64::MAX))).is_err());
        assert_eq!(
            i64::try_from_value(Value::Decimal(Some(Decimal::new(1200, 2)))).unwrap(),
            12
        );
        assert!(i64::try_from_value(Value::Decimal(Some(Decimal::new(1250, 2)))).is_err());
        assert_eq!(u64::MAX.as_value(), Value::Decimal(Some(Decimal::from(u64::MAX))));
        assert_eq!(u64::try_from_value(u64::MAX.as_value()).unwrap(), u64::MAX);
        assert_eq!(u64::try_from_value(5_u64.as_value()).unwrap(), 5);
        assert!(u64::try_from_value(Value::Int64(Some(-1))).is_err());
    }

    #[test]
    fn value_decimal() {
        let amount = Decimal::from_str("1234.5678").unwrap();
        assert_eq!(amount.as_value(), Value::Decimal(Some(amount)));
        assert_eq!(
            Decimal::try_from_value(Value::Int64(Some(10))).unwrap(),
            Decimal::from(10)
        );
        assert_eq!(
            Decimal::try_from_value(Value::Float64(Some(0.5))).unwrap(),
            Decimal::new(5, 1)
        );
        assert!(Decimal::try_from_value(Value::Float64(Some(f64::NAN))).is_err());
        assert_eq!(f64::try_from_value(Value::Int64(Some(3))).unwrap(), 3.0);
    }

    #[test]
    fn value_text_uuid_timestamp() {
        assert_eq!(Value::from("text"), Value::Varchar(Some("text".into())));
        assert_eq!(
            String::try_from_value("text".to_string().as_value()).unwrap(),
            "text"
        );
        assert!(String::try_from_value(Value::Int64(Some(1))).is_err());

        let uuid = Uuid::from_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(uuid.as_value(), Value::Uuid(Some(uuid)));
        assert_eq!(
            Uuid::try_from_value(Value::from("67e55044-10b1-426f-9247-bb680e5fe0c8")).unwrap(),
            uuid
        );
        assert!(Uuid::try_from_value(Value::from("not a uuid")).is_err());

        let timestamp = datetime!(2025-03-14 15:09:26);
        assert_eq!(
            time::PrimitiveDateTime::try_from_value(timestamp.as_value()).unwrap(),
            timestamp
        );
    }

    #[test]
    fn value_option() {
        assert_eq!(Some(5_i64).as_value(), Value::Int64(Some(5)));
        assert_eq!(Option::<String>::try_from_value(Value::Null).unwrap(), None);
        assert_eq!(
            Option::<String>::try_from_value(Value::Varchar(Some("x".into()))).unwrap(),
            Some("x".to_string())
        );
        assert_eq!(Option::<bool>::as_empty_value(), Value::Boolean(None));
    }

    #[test]
    fn entity_key_order() {
        let mut keys = vec![
            EntityKey::new("transfers", 1),
            EntityKey::new("accounts", 10),
            EntityKey::new("accounts", 2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            [
                EntityKey::new("accounts", 2),
                EntityKey::new("accounts", 10),
                EntityKey::new("transfers", 1),
            ]
        );
    }

    #[test]
    fn record_decode() {
        let record = Record {
            key: EntityKey::new("accounts", 3),
            version: 4,
            fields: Fields::from([
                ("owner".into(), Value::from("ada")),
                ("balance".into(), Decimal::new(995, 1).as_value()),
                ("note".into(), Value::Varchar(None)),
            ]),
        };
        assert_eq!(record.id(), 3);
        assert_eq!(record.get::<String>("owner").unwrap(), "ada");
        assert_eq!(record.get::<Decimal>("balance").unwrap(), Decimal::new(995, 1));
        assert_eq!(record.get::<Option<String>>("note").unwrap(), None);
        assert_eq!(record.get::<Option<i64>>("missing").unwrap(), None);
        let error = record.get::<i64>("owner").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Decode);
        assert!(
            matches!(&error, SessionError::Decode { found, .. } if found.contains("owner")),
            "Unexpected error {:?}",
            error
        );
    }

    #[test]
    fn filter_matches() {
        let fields = Fields::from([("status".into(), Value::from("pending"))]);
        assert!(Filter::All.matches(1, &fields));
        assert!(Filter::Ids(vec![1, 2]).matches(2, &fields));
        assert!(!Filter::Ids(vec![1, 2]).matches(3, &fields));
        assert!(Filter::equals("status", "pending").matches(9, &fields));
        assert!(!Filter::equals("status", "done").matches(9, &fields));
        assert!(Filter::equals("id", 9_i64).matches(9, &fields));
        assert!(!Filter::equals("missing", 1_i64).matches(9, &fields));
    }
}
