//! Fluent query builder backed by a clause AST.
//!
//! Clauses accumulate as typed nodes and a single serializer renders them,
//! so UPDATE/DELETE reuse the WHERE clauses structurally instead of by text
//! surgery. Terminal operations (`get`, `first`, `insert`, `update`,
//! `delete`, the aggregates) execute against an [`Executor`] and reset the
//! builder to its bare seeded state.

use crate::database::{Executor, Record};
use crate::error::{ServerError, ServerResult};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
struct Condition {
    boolean: &'static str,
    column: String,
    operator: String,
    param: String,
}

#[derive(Debug, Clone)]
struct Join {
    kind: &'static str,
    table: String,
    left: String,
    operator: String,
    right: String,
}

#[derive(Clone)]
pub struct Query {
    table: String,
    /// Static table name when seeded from a model; used for error subjects.
    static_table: Option<&'static str>,
    primary_key: Option<&'static str>,
    timestamps: Option<(&'static str, &'static str)>,
    columns: Vec<String>,
    aggregate: Option<String>,
    wheres: Vec<Condition>,
    joins: Vec<Join>,
    orders: Vec<(String, Direction)>,
    groups: Vec<String>,
    havings: Vec<Condition>,
    limit: Option<u64>,
    offset: Option<u64>,
    params: BTreeMap<String, Value>,
}

impl Query {
    pub fn table(table: &str) -> Query {
        Query {
            table: table.to_string(),
            static_table: None,
            primary_key: None,
            timestamps: None,
            columns: Vec::new(),
            aggregate: None,
            wheres: Vec::new(),
            joins: Vec::new(),
            orders: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            limit: None,
            offset: None,
            params: BTreeMap::new(),
        }
    }

    pub(crate) fn for_meta(meta: &'static super::ModelMeta) -> Query {
        let mut query = Query::table(meta.table);
        query.static_table = Some(meta.table);
        query.primary_key = meta.primary_key;
        query.timestamps = meta.timestamps;
        query
    }

    /// Bind a value, deriving the parameter name from the column. Dots and
    /// dashes become underscores so `users.created-at` still yields a valid
    /// identifier; the column keeps its original spelling in the SQL. A
    /// column bound twice gets a numbered parameter.
    fn bind<V: Into<Value>>(&mut self, column: &str, value: V) -> String {
        let base: String = column
            .chars()
            .map(|c| if c == '.' || c == '-' { '_' } else { c })
            .collect();
        let mut name = base.clone();
        let mut n = 1;
        while self.params.contains_key(&name) {
            n += 1;
            name = format!("{}_{}", base, n);
        }
        self.params.insert(name.clone(), value.into());
        name
    }

    pub fn where_<V: Into<Value>>(mut self, column: &str, value: V) -> Query {
        let param = self.bind(column, value);
        self.wheres.push(Condition {
            boolean: "AND",
            column: column.to_string(),
            operator: "=".to_string(),
            param,
        });
        self
    }

    pub fn or_where<V: Into<Value>>(mut self, column: &str, value: V) -> Query {
        let param = self.bind(column, value);
        self.wheres.push(Condition {
            boolean: "OR",
            column: column.to_string(),
            operator: "=".to_string(),
            param,
        });
        self
    }

    pub fn where_op<V: Into<Value>>(mut self, column: &str, operator: &str, value: V) -> Query {
        let param = self.bind(column, value);
        self.wheres.push(Condition {
            boolean: "AND",
            column: column.to_string(),
            operator: operator.to_string(),
            param,
        });
        self
    }

    pub fn join(self, table: &str, left: &str, operator: &str, right: &str) -> Query {
        self.join_kind("INNER JOIN", table, left, operator, right)
    }

    pub fn left_join(self, table: &str, left: &str, operator: &str, right: &str) -> Query {
        self.join_kind("LEFT JOIN", table, left, operator, right)
    }

    pub fn right_join(self, table: &str, left: &str, operator: &str, right: &str) -> Query {
        self.join_kind("RIGHT JOIN", table, left, operator, right)
    }

    pub fn full_join(self, table: &str, left: &str, operator: &str, right: &str) -> Query {
        self.join_kind("FULL JOIN", table, left, operator, right)
    }

    fn join_kind(
        mut self,
        kind: &'static str,
        table: &str,
        left: &str,
        operator: &str,
        right: &str,
    ) -> Query {
        self.joins.push(Join {
            kind,
            table: table.to_string(),
            left: left.to_string(),
            operator: operator.to_string(),
            right: right.to_string(),
        });
        self
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Query {
        self.orders.push((column.to_string(), direction));
        self
    }

    pub fn group_by(mut self, column: &str) -> Query {
        self.groups.push(column.to_string());
        self
    }

    pub fn having<V: Into<Value>>(mut self, column: &str, operator: &str, value: V) -> Query {
        let param = self.bind(column, value);
        self.havings.push(Condition {
            boolean: "AND",
            column: column.to_string(),
            operator: operator.to_string(),
            param,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Query {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Query {
        self.offset = Some(offset);
        self
    }

    /// Add projected columns; the default projection is `*`.
    pub fn select(mut self, columns: &[&str]) -> Query {
        self.columns
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    /// Render the SELECT this builder currently describes.
    pub fn to_sql(&self) -> String {
        let projection = match &self.aggregate {
            Some(aggregate) => aggregate.clone(),
            None if self.columns.is_empty() => "*".to_string(),
            None => self.columns.join(", "),
        };
        let mut sql = format!("SELECT {} FROM {}", projection, self.table);
        for join in &self.joins {
            sql.push_str(&format!(
                " {} {} ON {} {} {}",
                join.kind, join.table, join.left, join.operator, join.right
            ));
        }
        sql.push_str(&render_conditions("WHERE", &self.wheres));
        if !self.groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.groups.join(", ")));
        }
        sql.push_str(&render_conditions("HAVING", &self.havings));
        if !self.orders.is_empty() {
            let orders: Vec<String> = self
                .orders
                .iter()
                .map(|(column, direction)| format!("{} {}", column, direction.as_sql()))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }

    // Terminal operations. Each executes and resets the builder: the clause
    // list, parameter map and pagination all clear, only the table seed
    // stays.

    pub fn get(&mut self, db: &dyn Executor) -> ServerResult<Vec<Record>> {
        let sql = self.to_sql();
        let params = std::mem::take(&mut self.params);
        self.reset();
        tracing::debug!(%sql, "select");
        let rows = db.fetch(&sql, &params)?;
        Ok(rows.into_iter().map(Record::from_row).collect())
    }

    pub fn first(&mut self, db: &dyn Executor) -> ServerResult<Option<Record>> {
        self.limit = Some(1);
        Ok(self.get(db)?.into_iter().next())
    }

    pub fn find<V: Into<Value>>(&mut self, db: &dyn Executor, id: V) -> ServerResult<Option<Record>> {
        let key = self.key()?;
        let param = self.bind(key, id);
        self.wheres.push(Condition {
            boolean: "AND",
            column: key.to_string(),
            operator: "=".to_string(),
            param,
        });
        self.first(db)
    }

    pub fn find_or_fail<V: Into<Value>>(&mut self, db: &dyn Executor, id: V) -> ServerResult<Record> {
        self.find(db, id)?.ok_or(ServerError::NotFound)
    }

    pub fn count(&mut self, db: &dyn Executor) -> ServerResult<i64> {
        self.aggregate_on("COUNT", "*", db)
    }

    pub fn max(&mut self, db: &dyn Executor, column: &str) -> ServerResult<i64> {
        self.aggregate_on("MAX", column, db)
    }

    pub fn min(&mut self, db: &dyn Executor, column: &str) -> ServerResult<i64> {
        self.aggregate_on("MIN", column, db)
    }

    pub fn avg(&mut self, db: &dyn Executor, column: &str) -> ServerResult<i64> {
        self.aggregate_on("AVG", column, db)
    }

    pub fn sum(&mut self, db: &dyn Executor, column: &str) -> ServerResult<i64> {
        self.aggregate_on("SUM", column, db)
    }

    fn aggregate_on(&mut self, func: &str, column: &str, db: &dyn Executor) -> ServerResult<i64> {
        self.aggregate = Some(format!("{}({}) AS aggregate", func, column));
        let rows = self.get(db)?;
        Ok(rows
            .first()
            .and_then(|row| row.get("aggregate"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    /// INSERT the given fields, stamping the configured timestamp columns.
    pub fn insert(
        &mut self,
        db: &dyn Executor,
        mut data: serde_json::Map<String, Value>,
    ) -> ServerResult<u64> {
        if let Some((created, updated)) = self.timestamps {
            let now = now_stamp();
            data.entry(created.to_string())
                .or_insert_with(|| Value::String(now.clone()));
            data.entry(updated.to_string())
                .or_insert_with(|| Value::String(now));
        }

        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        for (column, value) in data {
            let param = self.bind(&column, value);
            columns.push(column);
            placeholders.push(format!(":{}", param));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.run(db, sql)
    }

    /// UPDATE with the accumulated WHERE clauses; the updated-at column is
    /// stamped automatically.
    pub fn update(
        &mut self,
        db: &dyn Executor,
        mut data: serde_json::Map<String, Value>,
    ) -> ServerResult<u64> {
        if let Some((_, updated)) = self.timestamps {
            data.entry(updated.to_string())
                .or_insert_with(|| Value::String(now_stamp()));
        }

        let mut sets = Vec::new();
        for (column, value) in data {
            let param = self.bind(&column, value);
            sets.push(format!("{} = :{}", column, param));
        }
        let sql = format!(
            "UPDATE {} SET {}{}",
            self.table,
            sets.join(", "),
            render_conditions("WHERE", &self.wheres)
        );
        self.run(db, sql)
    }

    /// DELETE with the accumulated WHERE clauses.
    pub fn delete(&mut self, db: &dyn Executor) -> ServerResult<u64> {
        let sql = format!(
            "DELETE FROM {}{}",
            self.table,
            render_conditions("WHERE", &self.wheres)
        );
        self.run(db, sql)
    }

    fn run(&mut self, db: &dyn Executor, sql: String) -> ServerResult<u64> {
        let params = std::mem::take(&mut self.params);
        self.reset();
        tracing::debug!(%sql, "execute");
        db.execute(&sql, &params)
    }

    pub(crate) fn key(&self) -> ServerResult<&'static str> {
        self.primary_key
            .ok_or(ServerError::MissingPrimaryKey(
                self.static_table.unwrap_or("query"),
            ))
    }

    fn reset(&mut self) {
        self.columns.clear();
        self.aggregate = None;
        self.wheres.clear();
        self.joins.clear();
        self.orders.clear();
        self.groups.clear();
        self.havings.clear();
        self.limit = None;
        self.offset = None;
        self.params.clear();
    }
}

/// Render a condition list. The first condition always uses the keyword, no
/// matter which boolean it asked for; the rest use their own.
fn render_conditions(keyword: &str, conditions: &[Condition]) -> String {
    let mut sql = String::new();
    for (i, condition) in conditions.iter().enumerate() {
        if i == 0 {
            sql.push_str(&format!(" {} ", keyword));
        } else {
            sql.push_str(&format!(" {} ", condition.boolean));
        }
        sql.push_str(&format!(
            "{} {} :{}",
            condition.column, condition.operator, condition.param
        ));
    }
    sql
}

fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}
