//! Eager loading of foreign-key associations.
//!
//! A [`Relation`] describes how rows of one model attach to another:
//! `HasOne`/`HasMany` look children up by foreign key, `BelongsTo` walks
//! back to the parent. Relations nest (`with`) and may be flagged recursive
//! for self-referencing adjacency data, in which case traversal carries
//! explicit key-name/current-value state, a visited set and a depth cap —
//! cyclic rows terminate with the chain truncated at the repeat.

use crate::database::{Executor, ModelMeta, Query, Record, Row};
use crate::error::ServerResult;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Hard ceiling for recursive traversal, over and above cycle detection.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
}

type Constraint = Arc<dyn Fn(Query) -> Query + Send + Sync>;

#[derive(Clone)]
pub struct Relation {
    kind: RelationKind,
    related: &'static ModelMeta,
    foreign_key: &'static str,
    local_key: &'static str,
    recursive: bool,
    constraint: Option<Constraint>,
    nested: Vec<(String, Relation)>,
}

impl Relation {
    pub fn has_one(
        related: &'static ModelMeta,
        foreign_key: &'static str,
        local_key: &'static str,
    ) -> Relation {
        Relation::new(RelationKind::HasOne, related, foreign_key, local_key)
    }

    pub fn has_many(
        related: &'static ModelMeta,
        foreign_key: &'static str,
        local_key: &'static str,
    ) -> Relation {
        Relation::new(RelationKind::HasMany, related, foreign_key, local_key)
    }

    pub fn belongs_to(
        related: &'static ModelMeta,
        foreign_key: &'static str,
        local_key: &'static str,
    ) -> Relation {
        Relation::new(RelationKind::BelongsTo, related, foreign_key, local_key)
    }

    fn new(
        kind: RelationKind,
        related: &'static ModelMeta,
        foreign_key: &'static str,
        local_key: &'static str,
    ) -> Relation {
        Relation {
            kind,
            related,
            foreign_key,
            local_key,
            recursive: false,
            constraint: None,
            nested: Vec::new(),
        }
    }

    /// Follow the association through the same table until the key runs out.
    pub fn recursive(mut self) -> Relation {
        self.recursive = true;
        self
    }

    /// Narrow the lookup query before it executes.
    pub fn constrain<F>(mut self, f: F) -> Relation
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.constraint = Some(Arc::new(f));
        self
    }

    /// Eager-load a nested relation under `alias` on every resolved row.
    pub fn with(mut self, alias: &str, relation: Relation) -> Relation {
        self.nested.push((alias.to_string(), relation));
        self
    }

    fn lookup_query(&self, value: Value) -> Query {
        let column = match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => self.foreign_key,
            RelationKind::BelongsTo => self.local_key,
        };
        let query = Query::for_meta(self.related).where_(column, value);
        match &self.constraint {
            Some(constraint) => constraint(query),
            None => query,
        }
    }

    /// The owning side's join value.
    fn start_value(&self, owner: &Row) -> Option<Value> {
        let column = match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => self.local_key,
            RelationKind::BelongsTo => self.foreign_key,
        };
        owner.get(column).filter(|v| !v.is_null()).cloned()
    }

    /// The key that continues a recursive chain from a resolved row.
    fn next_value(&self, row: &Row) -> Option<Value> {
        let column = match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => self.local_key,
            RelationKind::BelongsTo => self.foreign_key,
        };
        row.get(column).filter(|v| !v.is_null()).cloned()
    }
}

/// Resolve `relation` for every record and attach the result under `alias`.
pub fn load_related(
    records: &mut [Record],
    alias: &str,
    relation: &Relation,
    db: &dyn Executor,
) -> ServerResult<()> {
    for record in records.iter_mut() {
        let value = resolve(relation, alias, record.fields(), db)?;
        record.set(alias, value);
    }
    Ok(())
}

fn resolve(
    relation: &Relation,
    alias: &str,
    owner: &Row,
    db: &dyn Executor,
) -> ServerResult<Value> {
    let start = relation.start_value(owner);

    if relation.recursive {
        return match relation.kind {
            RelationKind::HasMany => {
                let mut guard = ChainGuard::new();
                resolve_tree(relation, alias, start, db, &mut guard)
            }
            _ => resolve_chain(relation, alias, start, db),
        };
    }

    match relation.kind {
        RelationKind::HasOne | RelationKind::BelongsTo => {
            let Some(value) = start else {
                return Ok(Value::Object(Map::new()));
            };
            match relation.lookup_query(value).first(db)? {
                Some(record) => {
                    let mut row = record.into_fields();
                    attach_nested(relation, &mut row, db)?;
                    Ok(Value::Object(row))
                }
                // No parent/child: an empty model, not an error.
                None => Ok(Value::Object(Map::new())),
            }
        }
        RelationKind::HasMany => {
            let Some(value) = start else {
                return Ok(Value::Array(Vec::new()));
            };
            let records = relation.lookup_query(value).get(db)?;
            let mut rows = Vec::with_capacity(records.len());
            for record in records {
                let mut row = record.into_fields();
                attach_nested(relation, &mut row, db)?;
                rows.push(Value::Object(row));
            }
            Ok(Value::Array(rows))
        }
    }
}

fn attach_nested(relation: &Relation, row: &mut Row, db: &dyn Executor) -> ServerResult<()> {
    for (alias, nested) in &relation.nested {
        let value = resolve(nested, alias, row, db)?;
        row.insert(alias.clone(), value);
    }
    Ok(())
}

/// Explicit traversal state for recursive relations: the key column being
/// followed, the value at hand, everything already seen, and how deep we
/// are.
struct ChainGuard {
    visited: HashSet<String>,
    depth: usize,
}

impl ChainGuard {
    fn new() -> Self {
        Self {
            visited: HashSet::new(),
            depth: 0,
        }
    }

    /// False once the value repeats or the chain is too deep.
    fn admit(&mut self, value: &Value) -> bool {
        if self.depth >= MAX_DEPTH {
            tracing::warn!(depth = self.depth, "recursive relation hit depth cap");
            return false;
        }
        self.depth += 1;
        if !self.visited.insert(value.to_string()) {
            tracing::warn!(value = %value, "cycle detected in recursive relation");
            return false;
        }
        true
    }
}

/// Follow a single-parent chain iteratively, then fold it into a nested
/// object from the tail end.
fn resolve_chain(
    relation: &Relation,
    alias: &str,
    start: Option<Value>,
    db: &dyn Executor,
) -> ServerResult<Value> {
    let mut chain: Vec<Row> = Vec::new();
    let mut guard = ChainGuard::new();
    let mut current = start;

    while let Some(value) = current {
        if !guard.admit(&value) {
            break;
        }
        let Some(record) = relation.lookup_query(value).first(db)? else {
            break;
        };
        let row = record.into_fields();
        current = relation.next_value(&row);
        chain.push(row);
    }

    let mut resolved = Value::Object(Map::new());
    for mut row in chain.into_iter().rev() {
        attach_nested(relation, &mut row, db)?;
        row.insert(alias.to_string(), resolved);
        resolved = Value::Object(row);
    }
    Ok(resolved)
}

/// Recursive has-many: children, their children and so on, sharing one
/// guard so cyclic data still terminates.
fn resolve_tree(
    relation: &Relation,
    alias: &str,
    start: Option<Value>,
    db: &dyn Executor,
    guard: &mut ChainGuard,
) -> ServerResult<Value> {
    let Some(value) = start else {
        return Ok(Value::Array(Vec::new()));
    };
    if !guard.admit(&value) {
        return Ok(Value::Array(Vec::new()));
    }

    let records = relation.lookup_query(value).get(db)?;
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let mut row = record.into_fields();
        let below = resolve_tree(relation, alias, relation.next_value(&row), db, guard)?;
        attach_nested(relation, &mut row, db)?;
        row.insert(alias.to_string(), below);
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::FakeExecutor;
    use serde_json::json;

    static USERS: ModelMeta = ModelMeta {
        table: "users",
        primary_key: Some("id"),
        timestamps: None,
    };

    static POSTS: ModelMeta = ModelMeta {
        table: "posts",
        primary_key: Some("id"),
        timestamps: None,
    };

    static COMMENTS: ModelMeta = ModelMeta {
        table: "comments",
        primary_key: Some("id"),
        timestamps: None,
    };

    static CATEGORIES: ModelMeta = ModelMeta {
        table: "categories",
        primary_key: Some("id"),
        timestamps: None,
    };

    #[test]
    fn has_one_attaches_first_row_or_empty_model() {
        let db = FakeExecutor::returning(vec![
            vec![FakeExecutor::row(&[("id", json!(1)), ("bio", json!("x"))])],
            vec![], // second owner has no profile
        ]);
        let relation = Relation::has_one(&USERS, "user_id", "id");
        let mut records = vec![
            Record::from_row(FakeExecutor::row(&[("id", json!(1))])),
            Record::from_row(FakeExecutor::row(&[("id", json!(2))])),
        ];
        load_related(&mut records, "profile", &relation, &db).unwrap();
        assert_eq!(records[0].get("profile").unwrap()["bio"], "x");
        assert_eq!(records[1].get("profile").unwrap(), &json!({}));
        assert_eq!(
            db.recorded_sql()[0],
            "SELECT * FROM users WHERE user_id = :user_id LIMIT 1"
        );
    }

    #[test]
    fn has_many_supports_nested_with() {
        let db = FakeExecutor::returning(vec![
            // posts for the user
            vec![FakeExecutor::row(&[("id", json!(10))])],
            // comments for post 10
            vec![FakeExecutor::row(&[("id", json!(100)), ("post_id", json!(10))])],
        ]);
        let relation = Relation::has_many(&POSTS, "user_id", "id")
            .with("comments", Relation::has_many(&COMMENTS, "post_id", "id"));
        let mut records = vec![Record::from_row(FakeExecutor::row(&[("id", json!(1))]))];
        load_related(&mut records, "posts", &relation, &db).unwrap();

        let posts = records[0].get("posts").unwrap().as_array().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["comments"][0]["id"], 100);
    }

    #[test]
    fn belongs_to_uses_the_owner_foreign_key() {
        let db = FakeExecutor::returning(vec![vec![FakeExecutor::row(&[
            ("id", json!(5)),
            ("name", json!("ada")),
        ])]]);
        let relation = Relation::belongs_to(&USERS, "user_id", "id");
        let mut records = vec![Record::from_row(FakeExecutor::row(&[
            ("id", json!(10)),
            ("user_id", json!(5)),
        ]))];
        load_related(&mut records, "author", &relation, &db).unwrap();
        assert_eq!(records[0].get("author").unwrap()["name"], "ada");
        assert_eq!(db.recorded_sql()[0], "SELECT * FROM users WHERE id = :id LIMIT 1");
    }

    #[test]
    fn constraint_narrows_the_lookup() {
        let db = FakeExecutor::returning(vec![vec![]]);
        let relation = Relation::has_many(&POSTS, "user_id", "id")
            .constrain(|q| q.where_("published", true));
        let mut records = vec![Record::from_row(FakeExecutor::row(&[("id", json!(1))]))];
        load_related(&mut records, "posts", &relation, &db).unwrap();
        assert_eq!(
            db.recorded_sql()[0],
            "SELECT * FROM posts WHERE user_id = :user_id AND published = :published"
        );
    }

    #[test]
    fn recursive_chain_follows_parents_until_null() {
        // category 3 -> parent 2 -> parent 1 -> no parent
        let db = FakeExecutor::returning(vec![
            vec![FakeExecutor::row(&[("id", json!(2)), ("parent_id", json!(1))])],
            vec![FakeExecutor::row(&[("id", json!(1)), ("parent_id", Value::Null)])],
        ]);
        let relation = Relation::belongs_to(&CATEGORIES, "parent_id", "id").recursive();
        let mut records = vec![Record::from_row(FakeExecutor::row(&[
            ("id", json!(3)),
            ("parent_id", json!(2)),
        ]))];
        load_related(&mut records, "parent", &relation, &db).unwrap();

        let parent = records[0].get("parent").unwrap();
        assert_eq!(parent["id"], 2);
        assert_eq!(parent["parent"]["id"], 1);
        assert_eq!(parent["parent"]["parent"], json!({}));
    }

    #[test]
    fn cyclic_chain_terminates_within_bounds() {
        // 1 -> 2 -> 1 -> 2 -> ... forever, were it not for the guard.
        let cycle: Vec<Vec<Row>> = (0..200)
            .map(|i| {
                if i % 2 == 0 {
                    vec![FakeExecutor::row(&[("id", json!(2)), ("parent_id", json!(1))])]
                } else {
                    vec![FakeExecutor::row(&[("id", json!(1)), ("parent_id", json!(2))])]
                }
            })
            .collect();
        let db = FakeExecutor::returning(cycle);
        let relation = Relation::belongs_to(&CATEGORIES, "parent_id", "id").recursive();
        let mut records = vec![Record::from_row(FakeExecutor::row(&[
            ("id", json!(1)),
            ("parent_id", json!(2)),
        ]))];
        load_related(&mut records, "parent", &relation, &db).unwrap();

        // The repeated key value stops the walk: only the two distinct
        // parents were ever fetched.
        assert_eq!(db.recorded_sql().len(), 2);
        let parent = records[0].get("parent").unwrap();
        assert_eq!(parent["id"], 2);
        assert_eq!(parent["parent"]["id"], 1);
        assert_eq!(parent["parent"]["parent"], json!({}));
    }
}
