//! Middleware example for Arbor
//!
//! This example demonstrates how to create and use middleware for:
//! - Logging requests
//! - Session-based authentication
//! - CORS handling

use arbor::middleware::{Cors, CorsConfig, Middleware, MiddlewareResult, Next};
use arbor::{Application, Request, Response, ServerError};
use std::time::Instant;

// Logger middleware that tracks request duration
struct Logger;

impl Middleware for Logger {
    fn call(&self, req: Request, next: Next) -> MiddlewareResult {
        Box::pin(async move {
            let start = Instant::now();
            let url = req.path.clone();
            let method = req.method;
            let res = next.handle(req).await;
            let status = match &res {
                Ok(res) => res.status,
                Err(err) => err.status_code(),
            };
            let duration = start.elapsed().as_millis();
            println!("[{}] {:?} {} - {}ms", status, method, url, duration);
            res
        })
    }

    fn clone_box(&self) -> Box<dyn Middleware> {
        Box::new(Self)
    }
}

// Auth middleware backed by the session
struct AuthRequired;

impl Middleware for AuthRequired {
    fn call(&self, req: Request, next: Next) -> MiddlewareResult {
        Box::pin(async move {
            if req.session.check() {
                next.handle(req).await
            } else {
                Err(ServerError::Unauthorized(
                    "Authentication required".to_string(),
                ))
            }
        })
    }

    fn clone_box(&self) -> Box<dyn Middleware> {
        Box::new(Self)
    }
}

fn main() {
    let mut app = Application::new();
    app.key("demo-app-key");

    // Apply logger and CORS middleware globally
    app.middleware(Logger);
    app.middleware(Cors::new(CorsConfig::default()));

    app.post("/login", |req| async move {
        req.session.login("demo-user");
        Ok(Response::text("logged in"))
    });

    app.post("/logout", |req| async move {
        req.session.logout();
        Ok(Response::text("logged out"))
    });

    // Route-level middleware: only authenticated sessions get through
    app.get("/profile", |req| async move {
        let id = req.session.auth_id().unwrap_or_default();
        Response::ok(&arbor::json!({ "user": id }))
    })
    .with(AuthRequired);

    app.listen("127.0.0.1:3000")
        .expect("Server failed to start")
}
