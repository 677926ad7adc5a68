use crate::database::{Executor, Query, Relation, Row};
use crate::error::{ServerError, ServerResult};
use serde_json::Value;

/// Static description of a table-backed model: where it lives, how rows are
/// identified, and which columns are stamped on write.
#[derive(Debug, Clone, Copy)]
pub struct ModelMeta {
    pub table: &'static str,
    pub primary_key: Option<&'static str>,
    pub timestamps: Option<(&'static str, &'static str)>,
}

/// A table-backed model. Implementations are usually empty structs carrying
/// a `ModelMeta` and, optionally, named relations for eager loading.
pub trait Model {
    fn meta() -> &'static ModelMeta;

    fn relations() -> Vec<(&'static str, Relation)> {
        Vec::new()
    }

    /// A builder seeded with this model's table, key and timestamp columns.
    fn query() -> Query {
        Query::for_meta(Self::meta())
    }

    fn all(db: &dyn Executor) -> ServerResult<Vec<Record>> {
        Self::query().get(db)
    }

    fn find<V: Into<Value>>(db: &dyn Executor, id: V) -> ServerResult<Option<Record>> {
        Self::query().find(db, id)
    }

    fn find_or_fail<V: Into<Value>>(db: &dyn Executor, id: V) -> ServerResult<Record> {
        Self::query().find_or_fail(db, id)
    }

    fn create(db: &dyn Executor, data: serde_json::Map<String, Value>) -> ServerResult<u64> {
        Self::query().insert(db, data)
    }

    /// Delete the row with the given primary key value.
    fn destroy<V: Into<Value>>(db: &dyn Executor, id: V) -> ServerResult<u64> {
        let meta = Self::meta();
        let key = meta
            .primary_key
            .ok_or(ServerError::MissingPrimaryKey(meta.table))?;
        Self::query().where_(key, id).delete(db)
    }
}

/// One loaded row: an explicit field map with typed accessors. Related rows
/// attach as nested values under their relation alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Row,
}

impl Record {
    pub fn from_row(row: Row) -> Record {
        Record { fields: row }
    }

    pub fn empty() -> Record {
        Record::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn str_(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_str())
    }

    pub fn i64_(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(|v| v.as_i64())
    }

    pub fn f64_(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(|v| v.as_f64())
    }

    pub fn bool_(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(|v| v.as_bool())
    }

    pub fn set<V: Into<Value>>(&mut self, field: &str, value: V) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn into_fields(self) -> Row {
        self.fields
    }

    /// Write the record back by primary key. Fails without a configured key
    /// or without a key value in the fields.
    pub fn save(&self, db: &dyn Executor, meta: &'static ModelMeta) -> ServerResult<u64> {
        let key = meta
            .primary_key
            .ok_or(ServerError::MissingPrimaryKey(meta.table))?;
        let id = self
            .fields
            .get(key)
            .cloned()
            .ok_or_else(|| ServerError::BadRequest(format!("record has no '{}' value", key)))?;

        let mut data = self.fields.clone();
        data.remove(key);
        Query::for_meta(meta).where_(key, id).update(db, data)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Value {
        Value::Object(record.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::FakeExecutor;
    use serde_json::json;

    struct User;

    static USER_META: ModelMeta = ModelMeta {
        table: "users",
        primary_key: Some("id"),
        timestamps: Some(("created_at", "updated_at")),
    };

    impl Model for User {
        fn meta() -> &'static ModelMeta {
            &USER_META
        }
    }

    struct Log;

    static LOG_META: ModelMeta = ModelMeta {
        table: "logs",
        primary_key: None,
        timestamps: None,
    };

    impl Model for Log {
        fn meta() -> &'static ModelMeta {
            &LOG_META
        }
    }

    #[test]
    fn find_queries_by_primary_key() {
        let db = FakeExecutor::returning(vec![vec![FakeExecutor::row(&[
            ("id", json!(7)),
            ("name", json!("ada")),
        ])]]);
        let user = User::find(&db, 7).unwrap().unwrap();
        assert_eq!(user.str_("name"), Some("ada"));
        assert_eq!(
            db.recorded_sql()[0],
            "SELECT * FROM users WHERE id = :id LIMIT 1"
        );
    }

    #[test]
    fn find_or_fail_maps_missing_row_to_not_found() {
        let db = FakeExecutor::returning(vec![vec![]]);
        assert!(matches!(
            User::find_or_fail(&db, 999),
            Err(ServerError::NotFound)
        ));
    }

    #[test]
    fn create_stamps_timestamp_columns() {
        let db = FakeExecutor::returning(vec![]);
        let mut data = serde_json::Map::new();
        data.insert("name".to_string(), json!("ada"));
        User::create(&db, data).unwrap();
        let log = db.log.lock().unwrap();
        let (sql, params) = &log[0];
        assert!(sql.contains("created_at"));
        assert!(sql.contains("updated_at"));
        let stamp = params["created_at"].as_str().unwrap();
        // Fixed fractional-seconds format: "2026-01-01 12:00:00.123456"
        assert_eq!(stamp.len(), 26);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[19..20], ".");
    }

    #[test]
    fn keyless_models_refuse_key_operations() {
        let db = FakeExecutor::returning(vec![]);
        assert!(matches!(
            Log::destroy(&db, 1),
            Err(ServerError::MissingPrimaryKey("logs"))
        ));
        let record = Record::from_row(FakeExecutor::row(&[("msg", json!("x"))]));
        assert!(matches!(
            record.save(&db, &LOG_META),
            Err(ServerError::MissingPrimaryKey("logs"))
        ));
    }

    #[test]
    fn save_updates_by_key_and_excludes_it_from_set() {
        let db = FakeExecutor::returning(vec![]);
        let record = Record::from_row(FakeExecutor::row(&[
            ("id", json!(7)),
            ("name", json!("ada")),
        ]));
        record.save(&db, &USER_META).unwrap();
        let log = db.log.lock().unwrap();
        let (sql, params) = &log[0];
        assert!(sql.starts_with("UPDATE users SET"));
        assert!(sql.contains("name = :name"));
        assert!(!sql.contains("SET id"));
        assert!(sql.ends_with("WHERE id = :id"));
        assert_eq!(params["id"], json!(7));
    }
}
