use crate::{EntityKey, Fields, Record, Result};

/// A Rust struct stored as one row of `TABLE`.
///
/// The `version` is owned by the storage: it is 1 after the insert and incremented by every
/// write. Implementations only copy it in and out.
///
/// ```rust
/// use sluice_core::{AsValue, Entity, Fields, Record, Result};
///
/// struct Account {
///     id: i64,
///     version: u64,
///     balance: i64,
/// }
///
/// impl Entity for Account {
///     const TABLE: &'static str = "accounts";
///     fn id(&self) -> i64 {
///         self.id
///     }
///     fn version(&self) -> u64 {
///         self.version
///     }
///     fn set_version(&mut self, version: u64) {
///         self.version = version;
///     }
///     fn to_fields(&self) -> Fields {
///         Fields::from([("balance".into(), self.balance.as_value())])
///     }
///     fn from_record(record: &Record) -> Result<Self> {
///         Ok(Self {
///             id: record.id(),
///             version: record.version,
///             balance: record.get("balance")?,
///         })
///     }
/// }
/// ```
pub trait Entity: Send + Sync + Sized {
    const TABLE: &'static str;

    fn id(&self) -> i64;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Every column but `id` and `version`.
    fn to_fields(&self) -> Fields;

    fn from_record(record: &Record) -> Result<Self>;

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::TABLE, self.id())
    }
}
