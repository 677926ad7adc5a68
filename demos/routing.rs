//! Routing example for Arbor
//!
//! This example demonstrates different routing techniques including:
//! - Basic routes
//! - Path parameters
//! - Validation with redirect-back on failure
//! - Route groups and named routes

use arbor::{Application, Group, Outcome, Response, ServerError};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Note {
    title: String,
    body: String,
}

fn main() {
    let mut app = Application::new();
    app.key("demo-app-key");

    // Basic GET route
    app.get("/", |_req| async {
        Ok(Response::text("Welcome to the Arbor API server!"))
    });

    // Route with path parameter
    app.get("/users/:id", |req| async move {
        let user_id = req
            .params
            .get("id")
            .cloned()
            .ok_or_else(|| ServerError::BadRequest("missing id".to_string()))?;
        Ok(Response::text(format!("User ID: {}", user_id)))
    });

    // POST with validation: failure redirects back with flash data, or
    // answers 422 JSON for fetch-style clients.
    app.post("/users", |mut req| async move {
        let data = match req.validate(&[
            ("name", "required|min:2"),
            ("email", "required|email"),
        ]) {
            Outcome::Continue(data) => data,
            Outcome::Redirect(response) => return Ok(response),
        };
        Response::created(&data)
    });

    // POST with a typed JSON body
    app.post("/notes", |req| async move {
        match req.body.json::<Note>() {
            Some(note) => Response::created(&note),
            None => Err(ServerError::BadRequest("Invalid JSON body".to_string())),
        }
    });

    // Group routes under /api with a shared name prefix
    app.group(Group::new().prefix("/api").name("api."), |r| {
        r.get("/status", |_req| async {
            Response::ok(&arbor::json!({
                "status": "operational",
                "version": "1.0.0"
            }))
        })
        .name("status");
    });

    app.listen("127.0.0.1:3000")
        .expect("Server failed to start")
}
