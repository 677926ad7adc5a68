use crate::handler::{Handler, HttpResponse, IntoResponse};
use crate::http::{Method, Request};
use crate::middleware::{Middleware, MiddlewareManager, Next};
use regex::Regex;
use std::collections::HashMap;

pub type RouteId = usize;

#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) id: RouteId,
    pub(crate) method: Method,
    pub(crate) pattern: String,
    pub(crate) regex: Regex,
    pub(crate) name: Option<String>,
    pub(crate) middlewares: MiddlewareManager,
    pub(crate) handler: Box<dyn Handler>,
}

impl Route {
    pub async fn handle(&self, req: Request) -> HttpResponse {
        self.middlewares
            .call(req, Next::new_handler(self.handler.clone()))
            .await
    }
}

/// Result of matching one (method, path) pair against the table.
pub(crate) enum RouteMatch<'r> {
    Found {
        route: &'r Route,
        params: HashMap<String, String>,
    },
    /// Some pattern matched the path, none matched the method.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// Attributes inherited by every route registered inside a group body.
#[derive(Default)]
pub struct Group {
    prefix: String,
    name: Option<String>,
    middlewares: MiddlewareManager,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.add(middleware);
        self
    }
}

#[derive(Clone, Default)]
struct GroupContext {
    prefix: String,
    name: String,
    middlewares: MiddlewareManager,
}

#[derive(Clone)]
pub struct Router {
    pub(crate) middlewares: MiddlewareManager,
    routes: Vec<Route>,
    context: GroupContext,
    next_id: RouteId,
}

impl Router {
    pub fn new() -> Self {
        Self {
            middlewares: MiddlewareManager::new(),
            routes: Vec::new(),
            context: GroupContext::default(),
            next_id: 0,
        }
    }

    pub fn get<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.add(Method::GET, path, handler);
        self
    }

    pub fn post<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.add(Method::POST, path, handler);
        self
    }

    pub fn put<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.add(Method::PUT, path, handler);
        self
    }

    pub fn patch<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.add(Method::PATCH, path, handler);
        self
    }

    pub fn delete<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.add(Method::DELETE, path, handler);
        self
    }

    pub fn options<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.add(Method::OPTIONS, path, handler);
        self
    }

    /// Register a route. Ids are handed out in insertion order and matching
    /// walks the table in that order, so specific routes declared first win
    /// over catch-alls declared later.
    pub fn add<F, R>(&mut self, method: Method, path: &str, handler: F) -> RouteId
    where
        F: Fn(Request) -> R + Send + Sync + Clone + 'static,
        R: IntoResponse,
    {
        let pattern = Self::normalize(&format!("{}{}", self.context.prefix, path));
        let regex = Self::compile(&pattern);

        let mut middlewares = self.middlewares.clone();
        middlewares.append(self.context.middlewares.clone());

        let id = self.next_id;
        self.next_id += 1;
        self.routes.push(Route {
            id,
            method,
            pattern,
            regex,
            name: None,
            middlewares,
            handler: Box::new(handler),
        });
        id
    }

    /// Name the most recently added route (the group's name prefix is
    /// prepended). Used by `url_for`.
    pub fn name(&mut self, name: &str) -> &mut Self {
        let full = format!("{}{}", self.context.name, name);
        if let Some(route) = self.routes.last_mut() {
            route.name = Some(full);
        }
        self
    }

    /// Add a middleware layer to the most recently added route. Runs inside
    /// any group/global layers already attached.
    pub fn with(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        if let Some(route) = self.routes.last_mut() {
            route.middlewares.add(middleware);
        }
        self
    }

    /// Global middleware applied to every route registered afterwards.
    pub fn middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middlewares.add(middleware);
    }

    /// Register a batch of routes sharing a prefix, name prefix and
    /// middleware. The group context is saved, extended for the body, then
    /// restored, so routes registered before or after are untouched. Groups
    /// nest.
    pub fn group<F>(&mut self, group: Group, body: F)
    where
        F: FnOnce(&mut Router),
    {
        let saved = self.context.clone();

        self.context.prefix = format!("{}{}", saved.prefix, group.prefix);
        if let Some(name) = group.name {
            self.context.name = format!("{}{}", saved.name, name);
        }
        let mut middlewares = saved.middlewares.clone();
        middlewares.append(group.middlewares);
        self.context.middlewares = middlewares;

        body(self);

        self.context = saved;
    }

    /// Match in insertion order. The first route whose pattern and method
    /// both match wins immediately; a pattern-only match after the full scan
    /// reports the allowed methods instead.
    pub(crate) fn match_route(&self, method: Method, path: &str) -> RouteMatch<'_> {
        let path = Self::normalize(path);
        let mut allowed: Vec<Method> = Vec::new();

        for route in &self.routes {
            let Some(captures) = route.regex.captures(&path) else {
                continue;
            };
            if route.method == method {
                let mut params = HashMap::new();
                for name in route.regex.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        params.insert(name.to_string(), value.as_str().to_string());
                    }
                }
                return RouteMatch::Found { route, params };
            }
            if !allowed.contains(&route.method) {
                allowed.push(route.method);
            }
        }

        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed(allowed)
        }
    }

    /// Reverse lookup: substitute `params` into the named route's pattern.
    pub fn url_for(&self, name: &str, params: &HashMap<String, String>) -> Option<String> {
        let route = self
            .routes
            .iter()
            .find(|route| route.name.as_deref() == Some(name))?;
        let url = route
            .pattern
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(param) => params
                    .get(param)
                    .map(|v| urlencoding::encode(v).into_owned())
                    .unwrap_or_default(),
                None => segment.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        Some(url)
    }

    fn normalize(path: &str) -> String {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    }

    /// Compile `/users/:id` into `^/users/(?P<id>[^/]+)$` — one named
    /// capture group per dynamic segment, literals escaped.
    fn compile(pattern: &str) -> Regex {
        let source: Vec<String> = pattern
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => format!("(?P<{}>[^/]+)", name),
                None => regex::escape(segment),
            })
            .collect();
        let anchored = format!("^{}$", source.join("/"));
        Regex::new(&anchored).expect("route pattern compiles")
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;

    fn router_with(routes: &[(Method, &str)]) -> Router {
        let mut router = Router::new();
        for (method, path) in routes {
            router.add(*method, path, |_req| async { Ok(Response::text("ok")) });
        }
        router
    }

    #[test]
    fn first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/users/new", |_req| async { Ok(Response::text("new")) });
        router.get("/users/:id", |_req| async { Ok(Response::text("show")) });

        match router.match_route(Method::GET, "/users/new") {
            RouteMatch::Found { route, params } => {
                assert_eq!(route.pattern, "/users/new");
                assert!(params.is_empty());
            }
            _ => panic!("expected a match"),
        }
        match router.match_route(Method::GET, "/users/7") {
            RouteMatch::Found { route, params } => {
                assert_eq!(route.pattern, "/users/:id");
                assert_eq!(params.get("id").map(String::as_str), Some("7"));
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn path_match_without_method_is_405() {
        let router = router_with(&[(Method::GET, "/posts"), (Method::PUT, "/posts")]);
        match router.match_route(Method::DELETE, "/posts") {
            RouteMatch::MethodNotAllowed(allow) => {
                assert_eq!(allow, vec![Method::GET, Method::PUT]);
            }
            _ => panic!("expected 405"),
        }
    }

    #[test]
    fn no_structural_match_is_404() {
        let router = router_with(&[(Method::GET, "/posts")]);
        assert!(matches!(
            router.match_route(Method::GET, "/missing"),
            RouteMatch::NotFound
        ));
    }

    #[test]
    fn params_do_not_cross_segments() {
        let router = router_with(&[(Method::GET, "/files/:name")]);
        assert!(matches!(
            router.match_route(Method::GET, "/files/a/b"),
            RouteMatch::NotFound
        ));
    }

    #[test]
    fn group_prefix_applies_only_inside_the_body() {
        let mut router = Router::new();
        router.get("/before", |_req| async { Ok(Response::text("ok")) });
        router.group(Group::new().prefix("/admin").name("admin."), |r| {
            r.get("/dash", |_req| async { Ok(Response::text("ok")) })
                .name("dash");
            r.group(Group::new().prefix("/api"), |r| {
                r.get("/ping", |_req| async { Ok(Response::text("ok")) });
            });
        });
        router.get("/after", |_req| async { Ok(Response::text("ok")) });

        for (path, should_match) in [
            ("/before", true),
            ("/after", true),
            ("/admin/dash", true),
            ("/admin/api/ping", true),
            ("/admin/before", false),
            ("/admin/after", false),
        ] {
            let matched = matches!(
                router.match_route(Method::GET, path),
                RouteMatch::Found { .. }
            );
            assert_eq!(matched, should_match, "path {}", path);
        }
    }

    #[test]
    fn route_ids_increase_with_insertion_order() {
        let mut router = Router::new();
        let a = router.add(Method::GET, "/a", |_req| async { Ok(Response::text("a")) });
        let b = router.add(Method::GET, "/b", |_req| async { Ok(Response::text("b")) });
        assert!(a < b);
    }

    #[test]
    fn url_for_substitutes_params() {
        let mut router = Router::new();
        router.group(Group::new().prefix("/admin").name("admin."), |r| {
            r.get("/users/:id", |_req| async { Ok(Response::text("ok")) })
                .name("users.show");
        });

        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        assert_eq!(
            router.url_for("admin.users.show", &params),
            Some("/admin/users/42".to_string())
        );
        assert_eq!(router.url_for("missing", &params), None);
    }
}
