//! Rule-driven input validation.
//!
//! Rules chain in one string per field (`"required|min:3|unik:users:email"`)
//! and run in declared order. The first failing rule is terminal for its
//! field — later rules are skipped — while other fields keep validating
//! independently. `nullable` fields that arrive empty are ignored outright
//! and nulled in the output. `unik` is the one side-effecting rule: it
//! counts live rows through the registered executor. File rules delete the
//! spooled upload the moment they fail.

use crate::database::{Db, Query};
use crate::http::UploadedFile;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

pub type ErrorMap = BTreeMap<String, String>;

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("email regex");
    static ref ALPHA_DASH: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("alpha_dash regex");
}

/// Content fragments that mark an upload as executable or script-bearing.
const SUSPECT_CONTENT: &[&[u8]] = &[
    b"<?php",
    b"<?=",
    b"<%",
    b"<script",
    b"#!",
    b"\x7fELF",
    b"MZ",
    b"$(",
    b"`",
];

pub struct Validator {
    data: Map<String, Value>,
    files: HashMap<String, Vec<UploadedFile>>,
    errors: ErrorMap,
    ignored: HashSet<String>,
    executor: Option<Db>,
}

impl Validator {
    pub fn new(data: Map<String, Value>, files: HashMap<String, Vec<UploadedFile>>) -> Validator {
        Validator {
            data,
            files,
            errors: ErrorMap::new(),
            ignored: HashSet::new(),
            executor: None,
        }
    }

    pub fn with_executor(mut self, db: Db) -> Validator {
        self.executor = Some(db);
        self
    }

    /// Validate every field against its rule chain. `Ok` carries the
    /// validated data (ignored fields nulled, file fields replaced by
    /// metadata); `Err` carries the first error recorded per field.
    pub fn run(mut self, rules: &[(&str, &str)]) -> Result<Map<String, Value>, ErrorMap> {
        for (field, chain) in rules {
            let parts: Vec<&str> = chain.split('|').filter(|r| !r.is_empty()).collect();

            // A nullable field that arrived empty skips its whole chain.
            if parts.contains(&"nullable") && self.is_empty(field) {
                self.ignored.insert(field.to_string());
                continue;
            }

            for rule in parts {
                if self.errors.contains_key(*field) {
                    break;
                }
                self.apply(field, rule);
            }
        }

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let mut validated = self.data;
        for field in &self.ignored {
            validated.insert(field.clone(), Value::Null);
        }
        for (field, list) in self.files {
            let meta: Vec<Value> = list
                .iter()
                .map(|file| {
                    serde_json::json!({
                        "name": file.filename,
                        "size": file.size(),
                        "type": file.content_type,
                    })
                })
                .collect();
            validated.insert(field, Value::Array(meta));
        }
        Ok(validated)
    }

    fn apply(&mut self, field: &str, rule: &str) {
        let (name, arg) = match rule.split_once(':') {
            Some((name, arg)) => (name, arg),
            None => (rule, ""),
        };

        if self.files.contains_key(field) {
            self.apply_file_rule(field, name, arg);
            return;
        }

        match name {
            "nullable" => {}
            "required" => {
                if self.is_empty(field) {
                    self.fail(field, format!("The {} field is required.", field));
                }
            }
            "min" => {
                let min: f64 = arg.parse().unwrap_or(0.0);
                match self.measure(field) {
                    Some(size) if size < min => self.fail(
                        field,
                        format!("The {} field must be at least {}.", field, arg),
                    ),
                    _ => {}
                }
            }
            "max" => {
                let max: f64 = arg.parse().unwrap_or(f64::MAX);
                match self.measure(field) {
                    Some(size) if size > max => self.fail(
                        field,
                        format!("The {} field must not be greater than {}.", field, arg),
                    ),
                    _ => {}
                }
            }
            "email" => {
                let ok = self
                    .str_value(field)
                    .map(|s| EMAIL.is_match(&s))
                    .unwrap_or(false);
                if !ok {
                    self.fail(field, format!("The {} field must be a valid email address.", field));
                }
            }
            "numeric" => {
                let ok = match self.data.get(field) {
                    Some(Value::Number(_)) => true,
                    Some(Value::String(s)) => s.parse::<f64>().is_ok(),
                    _ => false,
                };
                if !ok {
                    self.fail(field, format!("The {} field must be a number.", field));
                }
            }
            "alpha_dash" => {
                let ok = self
                    .str_value(field)
                    .map(|s| ALPHA_DASH.is_match(&s))
                    .unwrap_or(false);
                if !ok {
                    self.fail(
                        field,
                        format!(
                            "The {} field may only contain letters, numbers, dashes and underscores.",
                            field
                        ),
                    );
                }
            }
            "in" => {
                let allowed: Vec<&str> = arg.split(',').collect();
                let ok = self
                    .str_value(field)
                    .map(|s| allowed.contains(&s.as_str()))
                    .unwrap_or(false);
                if !ok {
                    self.fail(field, format!("The selected {} is invalid.", field));
                }
            }
            "confirmed" => {
                let confirmation = format!("{}_confirmation", field);
                if self.data.get(field) != self.data.get(confirmation.as_str()) {
                    self.fail(field, format!("The {} confirmation does not match.", field));
                }
            }
            "unik" => self.apply_unik(field, arg),
            unknown => {
                tracing::warn!(rule = unknown, field, "unknown validation rule skipped");
            }
        }
    }

    /// `unik:table:column` — a live uniqueness lookup against the database.
    fn apply_unik(&mut self, field: &str, arg: &str) {
        let (table, column) = match arg.split_once(':') {
            Some(pair) => pair,
            None => (arg, field),
        };
        let value = match self.data.get(field) {
            Some(value) => value.clone(),
            None => return,
        };
        let Some(db) = self.executor.clone() else {
            self.fail(
                field,
                format!("The {} field could not be checked for uniqueness.", field),
            );
            return;
        };
        match Query::table(table).where_(column, value).count(&*db) {
            Ok(0) => {}
            Ok(_) => self.fail(field, format!("The {} has already been taken.", field)),
            Err(err) => {
                tracing::error!(%err, table, column, "uniqueness lookup failed");
                self.fail(
                    field,
                    format!("The {} field could not be checked for uniqueness.", field),
                );
            }
        }
    }

    fn apply_file_rule(&mut self, field: &str, name: &str, arg: &str) {
        let failure = match name {
            "required" | "file" => {
                let present = self
                    .files
                    .get(field)
                    .map(|list| list.iter().any(|f| !f.data.is_empty()))
                    .unwrap_or(false);
                (!present).then(|| format!("The {} field must be a valid upload.", field))
            }
            "mimes" => {
                let allowed: Vec<String> =
                    arg.split(',').map(|ext| ext.to_ascii_lowercase()).collect();
                let all_allowed = self.files[field].iter().all(|file| {
                    file.extension()
                        .map(|ext| allowed.contains(&ext.to_ascii_lowercase()))
                        .unwrap_or(false)
                });
                (!all_allowed).then(|| {
                    format!("The {} field must be a file of type: {}.", field, arg)
                })
            }
            "max_kb" => {
                let max_bytes: usize = arg.parse::<usize>().unwrap_or(usize::MAX) * 1024;
                let too_big = self.files[field].iter().any(|f| f.size() > max_bytes);
                too_big.then(|| {
                    format!("The {} field must not be greater than {} kilobytes.", field, arg)
                })
            }
            "clean" => {
                let dirty = self.files[field].iter().any(|file| {
                    SUSPECT_CONTENT.iter().any(|marker| {
                        file.data
                            .windows(marker.len())
                            .any(|window| window == *marker)
                    })
                });
                dirty.then(|| format!("The {} field contains a disallowed file.", field))
            }
            "nullable" => None,
            unknown => {
                tracing::warn!(rule = unknown, field, "unknown file rule skipped");
                None
            }
        };

        if let Some(message) = failure {
            // Fail fast: the rejected upload is removed from disk now, not
            // at some later cleanup point.
            if let Some(list) = self.files.get_mut(field) {
                for file in list.iter_mut() {
                    file.discard();
                }
            }
            self.fail(field, message);
        }
    }

    /// Record the field's first (and only) error.
    fn fail(&mut self, field: &str, message: String) {
        self.errors.entry(field.to_string()).or_insert(message);
    }

    fn is_empty(&self, field: &str) -> bool {
        if let Some(list) = self.files.get(field) {
            return list.iter().all(|f| f.data.is_empty());
        }
        match self.data.get(field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            Some(_) => false,
        }
    }

    /// Size of a value for min/max: numbers compare by magnitude, strings by
    /// character count, arrays by length.
    fn measure(&self, field: &str) -> Option<f64> {
        match self.data.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(a) => Some(a.len() as f64),
            _ => None,
        }
    }

    fn str_value(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::FakeExecutor;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn first_error_per_field_wins() {
        let validator = Validator::new(data(&[("email", json!(""))]), HashMap::new());
        let errors = validator
            .run(&[("email", "required|email")])
            .unwrap_err();
        assert_eq!(errors["email"], "The email field is required.");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn other_fields_validate_independently() {
        let validator = Validator::new(
            data(&[("name", json!("")), ("age", json!("abc"))]),
            HashMap::new(),
        );
        let errors = validator
            .run(&[("name", "required"), ("age", "numeric")])
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn nullable_empty_field_is_ignored_and_nulled() {
        let validator = Validator::new(data(&[("nickname", json!(""))]), HashMap::new());
        let validated = validator
            .run(&[("nickname", "nullable|min:3")])
            .unwrap();
        assert_eq!(validated["nickname"], Value::Null);
    }

    #[test]
    fn nullable_present_field_still_validates() {
        let validator = Validator::new(data(&[("nickname", json!("ab"))]), HashMap::new());
        let errors = validator
            .run(&[("nickname", "nullable|min:3")])
            .unwrap_err();
        assert!(errors.contains_key("nickname"));
    }

    #[test]
    fn min_max_measure_strings_and_numbers() {
        let validator = Validator::new(
            data(&[("name", json!("ada")), ("age", json!(17))]),
            HashMap::new(),
        );
        let errors = validator
            .run(&[("name", "min:2|max:10"), ("age", "min:18")])
            .unwrap_err();
        assert!(!errors.contains_key("name"));
        assert_eq!(errors["age"], "The age field must be at least 18.");
    }

    #[test]
    fn confirmed_compares_the_confirmation_field() {
        let validator = Validator::new(
            data(&[
                ("password", json!("secret")),
                ("password_confirmation", json!("other")),
            ]),
            HashMap::new(),
        );
        let errors = validator.run(&[("password", "confirmed")]).unwrap_err();
        assert_eq!(errors["password"], "The password confirmation does not match.");
    }

    #[test]
    fn in_rule_checks_membership() {
        let validator = Validator::new(data(&[("role", json!("root"))]), HashMap::new());
        let errors = validator.run(&[("role", "in:admin,editor")]).unwrap_err();
        assert_eq!(errors["role"], "The selected role is invalid.");
    }

    #[test]
    fn unik_counts_through_the_executor() {
        let taken = FakeExecutor::returning(vec![vec![FakeExecutor::row(&[(
            "aggregate",
            json!(1),
        )])]]);
        let validator = Validator::new(data(&[("email", json!("a@b.co"))]), HashMap::new())
            .with_executor(Db(Arc::new(taken)));
        let errors = validator
            .run(&[("email", "unik:users:email")])
            .unwrap_err();
        assert_eq!(errors["email"], "The email has already been taken.");

        let free = FakeExecutor::returning(vec![vec![FakeExecutor::row(&[(
            "aggregate",
            json!(0),
        )])]]);
        let validator = Validator::new(data(&[("email", json!("a@b.co"))]), HashMap::new())
            .with_executor(Db(Arc::new(free)));
        assert!(validator.run(&[("email", "unik:users:email")]).is_ok());
    }

    fn upload(field: &str, filename: &str, content: &[u8]) -> UploadedFile {
        UploadedFile {
            field: field.to_string(),
            filename: filename.to_string(),
            content_type: "application/octet-stream".to_string(),
            data: content.to_vec(),
            temp_path: None,
        }
    }

    #[test]
    fn file_rules_check_extension_and_size() {
        let mut files = HashMap::new();
        files.insert("avatar".to_string(), vec![upload("avatar", "a.exe", b"x")]);
        let validator = Validator::new(Map::new(), files);
        let errors = validator
            .run(&[("avatar", "file|mimes:jpg,png|max_kb:1")])
            .unwrap_err();
        assert_eq!(errors["avatar"], "The avatar field must be a file of type: jpg,png.");

        let mut files = HashMap::new();
        files.insert(
            "avatar".to_string(),
            vec![upload("avatar", "a.png", &vec![0u8; 4096])],
        );
        let validator = Validator::new(Map::new(), files);
        let errors = validator
            .run(&[("avatar", "file|mimes:jpg,png|max_kb:1")])
            .unwrap_err();
        assert!(errors["avatar"].contains("kilobytes"));
    }

    #[test]
    fn clean_rule_rejects_script_content_and_discards_the_temp_file() {
        let mut temp = tempfile::NamedTempFile::new().expect("temp file");
        temp.write_all(b"<?php evil();").expect("write");
        let path = temp.path().to_path_buf();
        // Keep the file on disk after dropping the handle.
        let (_, kept_path) = temp.keep().expect("keep");
        assert!(kept_path.exists());

        let mut file = upload("doc", "doc.txt", b"harmless <?php evil(); text");
        file.temp_path = Some(path.clone());
        let mut files = HashMap::new();
        files.insert("doc".to_string(), vec![file]);

        let validator = Validator::new(Map::new(), files);
        let errors = validator.run(&[("doc", "file|clean")]).unwrap_err();
        assert_eq!(errors["doc"], "The doc field contains a disallowed file.");
        assert!(!kept_path.exists(), "temp upload removed on rejection");
    }

    #[test]
    fn valid_files_surface_as_metadata() {
        let mut files = HashMap::new();
        files.insert(
            "avatar".to_string(),
            vec![upload("avatar", "a.png", b"binary image data")],
        );
        let validator = Validator::new(Map::new(), files);
        let validated = validator
            .run(&[("avatar", "file|mimes:png|max_kb:64")])
            .unwrap();
        assert_eq!(validated["avatar"][0]["name"], "a.png");
        assert_eq!(validated["avatar"][0]["size"], 17);
    }
}
