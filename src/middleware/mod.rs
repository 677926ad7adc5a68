mod compression;
mod security;

use crate::http::Request;
pub use compression::{CompressionConfig, CompressionMiddleware};
pub use security::{Cors, CorsConfig, RateLimitConfig, RateLimiter, SecurityConfig, SecurityHeaders};

use crate::handler::{Handler, HttpResponse, IntoResponse};
use futures::future::BoxFuture;

#[derive(Clone)]
pub struct Next {
    handler: Box<dyn Handler>,
}

impl Next {
    pub fn new<F, R>(handler: F) -> Self
    where
        F: Fn(Request) -> R + Send + Sync + Clone + 'static,
        R: IntoResponse,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    pub(crate) fn new_handler(handler: Box<dyn Handler>) -> Self {
        Self { handler }
    }

    pub async fn handle(&self, req: Request) -> HttpResponse {
        self.handler.handle(req).await
    }
}

pub type MiddlewareResult = BoxFuture<'static, HttpResponse>;

/// A layer wrapped around the core handler. Layers run in declaration order
/// outermost-first; each may act before and after calling `next`, answer
/// without calling it, or return an error that unwinds through the layers
/// outside it. The chain invokes every layer at most once per request.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, req: Request, next: Next) -> MiddlewareResult;
    fn clone_box(&self) -> Box<dyn Middleware>;
}

impl Clone for Box<dyn Middleware> {
    fn clone(&self) -> Box<dyn Middleware> {
        self.clone_box()
    }
}

#[derive(Clone, Default)]
pub(crate) struct MiddlewareManager {
    pub(crate) middlewares: Vec<Box<dyn Middleware>>,
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Box::new(middleware));
    }

    pub fn append(&mut self, mut other: MiddlewareManager) -> &Self {
        self.middlewares.append(&mut other.middlewares);
        self
    }

    /// Fold the layers around the core continuation. Iterating in reverse
    /// leaves the first-declared layer outermost.
    pub async fn call(&self, req: Request, next: Next) -> HttpResponse {
        let mut next = next;
        let mut index = self.middlewares.len();
        while index > 0 {
            index -= 1;
            let middleware = self.middlewares[index].clone();
            next = Next::new_handler(Box::new(move |req| middleware.call(req, next.clone())));
        }
        next.handle(req).await
    }
}

#[macro_export]
macro_rules! middlewares {
    ($handler:expr) => {
       $handler
    };

    ($middleware:expr, $handler:expr) => {
        |req| {
            $middleware.call(req, $crate::middleware::Next::new($handler))
        }
    };

    ($middleware:expr, $($rest:tt)*) => {
        |req| {
            $middleware.call(req, $crate::middleware::Next::new(middlewares!($($rest)*)))
        }
    };

    () => {
        compile_error!("The middlewares! macro requires at least one handler")
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Method, Response};
    use crate::plugins::Plugins;
    use crate::session::Session;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn test_request() -> Request {
        Request {
            method: Method::GET,
            path: "/".to_string(),
            query: HashMap::new(),
            params: HashMap::new(),
            headers: HashMap::new(),
            input: serde_json::Map::new(),
            files: HashMap::new(),
            body: Body::new(),
            session: Session::new(),
            plugins: Plugins::new(),
        }
    }

    struct Tracer {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tracer {
        fn call(&self, req: Request, next: Next) -> MiddlewareResult {
            let label = self.label;
            let log = self.log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("{}:before", label));
                let res = next.handle(req).await;
                log.lock().unwrap().push(format!("{}:after", label));
                res
            })
        }

        fn clone_box(&self) -> Box<dyn Middleware> {
            Box::new(Tracer {
                label: self.label,
                log: self.log.clone(),
            })
        }
    }

    #[tokio::test]
    async fn layers_wrap_in_declaration_order() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MiddlewareManager::new();
        for label in ["a", "b", "c"] {
            manager.add(Tracer {
                label,
                log: log.clone(),
            });
        }

        let core_log = log.clone();
        let core = Next::new(move |_req| {
            let core_log = core_log.clone();
            async move {
                core_log.lock().unwrap().push("core".to_string());
                Ok(Response::text("ok"))
            }
        });

        manager.call(test_request(), core).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:before", "b:before", "c:before", "core", "c:after", "b:after", "a:after"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        struct Halt;
        impl Middleware for Halt {
            fn call(&self, _req: Request, _next: Next) -> MiddlewareResult {
                Box::pin(async { Ok(Response::new(403)) })
            }
            fn clone_box(&self) -> Box<dyn Middleware> {
                Box::new(Halt)
            }
        }

        let mut manager = MiddlewareManager::new();
        manager.add(Tracer {
            label: "outer",
            log: log.clone(),
        });
        manager.add(Halt);
        manager.add(Tracer {
            label: "inner",
            log: log.clone(),
        });

        let core = Next::new(|_req| async { Ok(Response::text("unreachable")) });
        let response = manager.call(test_request(), core).await.unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(*log.lock().unwrap(), vec!["outer:before", "outer:after"]);
    }
}
