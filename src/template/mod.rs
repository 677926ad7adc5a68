//! The directive template engine.
//!
//! Templates are plain files with a `.template` extension under a views
//! directory, named with dots (`admin.users.index` →
//! `admin/users/index.template`). Compilation runs tokenizer → parser →
//! AST; rendering executes the AST against a `serde_json` context plus the
//! per-request [`ViewContext`] (auth flag, validation errors, old input,
//! CSRF token). Compiled templates live in an in-process cache keyed by
//! name and validated against a content hash, so edited files recompile on
//! the next request.

mod expr;
mod lexer;
mod parser;
mod render;

use crate::cache::CacheManager;
use crate::error::{ServerError, ServerResult};
use crate::http::{Request, Response};
use crate::session::Session;
use parser::Template;
use render::Renderer;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-request view state feeding `@auth`, `@guest`, `@error`, `@csrf`, and
/// the `$errors`/`$old` variables.
#[derive(Debug, Default, Clone)]
pub struct ViewContext {
    pub auth: bool,
    pub errors: BTreeMap<String, String>,
    pub old: Map<String, Value>,
    pub csrf_token: String,
}

impl ViewContext {
    /// Pull auth state, flashed validation data and the CSRF token out of
    /// the session.
    pub fn from_session(session: &Session) -> ViewContext {
        let errors = match session.flashed("errors") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        };
        let old = match session.flashed("old") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        ViewContext {
            auth: session.check(),
            errors,
            old,
            csrf_token: session.csrf_token(),
        }
    }
}

#[derive(Clone)]
struct CachedTemplate {
    hash: String,
    template: Arc<Template>,
}

pub struct Engine {
    views_dir: PathBuf,
    cache: CacheManager<String, CachedTemplate>,
}

impl Engine {
    pub fn new<P: Into<PathBuf>>(views_dir: P) -> Engine {
        Engine {
            views_dir: views_dir.into(),
            cache: CacheManager::unexpiring(256),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let mut path = self.views_dir.clone();
        for part in name.split('.') {
            path.push(part);
        }
        path.set_extension("template");
        path
    }

    /// Load and parse a template, reusing the cached AST while the source
    /// hash is unchanged.
    pub(crate) fn compile(&self, name: &str) -> ServerResult<Arc<Template>> {
        let path = self.path_for(name);
        let source = std::fs::read_to_string(&path).map_err(|_| {
            ServerError::Template(format!("template '{}' not found at {}", name, path.display()))
        })?;

        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        if let Some(cached) = self.cache.get(&name.to_string()) {
            if cached.hash == hash {
                return Ok(cached.template);
            }
        }

        let template = Arc::new(parser::parse(&source)?);
        self.cache.set(
            name.to_string(),
            CachedTemplate {
                hash,
                template: template.clone(),
            },
        );
        Ok(template)
    }

    /// Render `name` with `data` merged under the view context. `$errors`,
    /// `$old` and `$auth` are reserved names the context always provides.
    pub fn render(&self, name: &str, data: Value, ctx: &ViewContext) -> ServerResult<String> {
        let template = self.compile(name)?;

        let mut root = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        root.insert(
            "errors".to_string(),
            Value::Object(
                ctx.errors
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        root.insert("old".to_string(), Value::Object(ctx.old.clone()));
        root.insert("auth".to_string(), Value::Bool(ctx.auth));
        let root = Value::Object(root);

        Renderer::new(self, ctx).render(&template, &root)
    }
}

/// Shared engine handle stored in the plugin registry.
#[derive(Clone)]
pub struct Views(pub Arc<Engine>);

impl Request {
    /// Render a template into an HTML response, wiring the session's auth
    /// state, flashed errors/old input and CSRF token into the view.
    pub fn view(&self, name: &str, data: Value) -> ServerResult<Response> {
        let views = self
            .plugins
            .get::<Views>()
            .cloned()
            .ok_or_else(|| ServerError::InternalError("no view engine configured".to_string()))?;
        let ctx = ViewContext::from_session(&self.session);
        let html = views.0.render(name, data, &ctx)?;
        Ok(Response::html(html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn engine_with(templates: &[(&str, &str)]) -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, source) in templates {
            let path = dir.path().join(format!("{}.template", name.replace('.', "/")));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(path, source).expect("write template");
        }
        let engine = Engine::new(dir.path());
        (dir, engine)
    }

    fn render(engine: &Engine, name: &str, data: Value) -> String {
        engine.render(name, data, &ViewContext::default()).unwrap()
    }

    #[test]
    fn if_else_renders_the_taken_branch() {
        let (_dir, engine) = engine_with(&[("cond", "@if(true) X @else Y @endif")]);
        assert_eq!(render(&engine, "cond", json!({})).trim(), "X");
        let (_dir, engine) = engine_with(&[("cond", "@if($flag) X @else Y @endif")]);
        assert_eq!(render(&engine, "cond", json!({"flag": false})).trim(), "Y");
    }

    #[test]
    fn escaped_and_raw_echo() {
        let (_dir, engine) = engine_with(&[("echo", "{{ $x }}|{!! $x !!}")]);
        assert_eq!(
            render(&engine, "echo", json!({"x": "<b>"})),
            "&lt;b&gt;|<b>"
        );
    }

    #[test]
    fn foreach_binds_keys_and_values() {
        let (_dir, engine) = engine_with(&[(
            "list",
            "@foreach($items as $i => $item)[{{ $i }}:{{ $item }}]@endforeach",
        )]);
        assert_eq!(
            render(&engine, "list", json!({"items": ["a", "b"]})),
            "[0:a][1:b]"
        );
    }

    #[test]
    fn for_range_with_break_and_continue() {
        let (_dir, engine) = engine_with(&[(
            "loop",
            "@for($i in 0..10)@if($i == 1)@continue@endif@if($i == 3)@break@endif{{ $i }}@endfor",
        )]);
        assert_eq!(render(&engine, "loop", json!({})), "02");
    }

    #[test]
    fn isset_and_empty_blocks() {
        let (_dir, engine) = engine_with(&[(
            "t",
            "@isset($a)A@endisset@empty($b)B@endempty",
        )]);
        assert_eq!(render(&engine, "t", json!({"a": 1, "b": []})), "AB");
        assert_eq!(render(&engine, "t", json!({"b": [1]})), "");
    }

    #[test]
    fn layout_inheritance_splices_sections() {
        let (_dir, engine) = engine_with(&[
            ("layout", "<html>@content('body')</html>"),
            ("page", "@extend('layout')@section('body')hello@endsection"),
        ]);
        assert_eq!(render(&engine, "page", json!({})), "<html>hello</html>");
    }

    #[test]
    fn include_renders_with_the_current_scope() {
        let (_dir, engine) = engine_with(&[
            ("partials.badge", "[{{ $name }}]"),
            ("page", "@foreach($users as $name)@include('partials.badge')@endforeach"),
        ]);
        assert_eq!(
            render(&engine, "page", json!({"users": ["a", "b"]})),
            "[a][b]"
        );
    }

    #[test]
    fn auth_guest_error_and_csrf_directives() {
        let (_dir, engine) = engine_with(&[(
            "form",
            "@auth in @endauth@guest out @endguest@error('email'){{ $message }}@enderror@csrf",
        )]);
        let ctx = ViewContext {
            auth: true,
            errors: [("email".to_string(), "bad email".to_string())].into(),
            old: Map::new(),
            csrf_token: "tok123".to_string(),
        };
        let html = engine.render("form", json!({}), &ctx).unwrap();
        assert!(html.contains(" in "));
        assert!(!html.contains(" out "));
        assert!(html.contains("bad email"));
        assert!(html.contains("name=\"_token\" value=\"tok123\""));
    }

    #[test]
    fn old_input_is_reachable_from_expressions() {
        let (_dir, engine) = engine_with(&[("f", "<input value=\"{{ $old.email }}\">")]);
        let ctx = ViewContext {
            old: [("email".to_string(), json!("a@b.co"))].into_iter().collect(),
            ..ViewContext::default()
        };
        assert_eq!(
            engine.render("f", json!({}), &ctx).unwrap(),
            "<input value=\"a@b.co\">"
        );
    }

    #[test]
    fn edited_templates_recompile_automatically() {
        let (dir, engine) = engine_with(&[("t", "one")]);
        assert_eq!(render(&engine, "t", json!({})), "one");
        fs::write(dir.path().join("t.template"), "two").expect("rewrite");
        assert_eq!(render(&engine, "t", json!({})), "two");
    }

    #[test]
    fn method_spoof_field_renders() {
        let (_dir, engine) = engine_with(&[("f", "@method('PUT')")]);
        assert_eq!(
            render(&engine, "f", json!({})),
            "<input type=\"hidden\" name=\"_method\" value=\"PUT\">"
        );
    }
}
