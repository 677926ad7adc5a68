//! A minimal "Hello, World!" server using Arbor
//!
//! This example demonstrates how to create a basic server that responds with
//! "Hello, World!" for all requests.

use arbor::{Application, Response};

fn main() {
    let mut app = Application::new();

    // Add a route that handles GET requests to "/"
    app.get("/", |_req| async { Ok(Response::text("Hello, World!")) });

    app.listen("127.0.0.1:3000")
        .expect("Server failed to start");
}
