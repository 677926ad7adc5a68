//! # Arbor
//!
//! A batteries-included web application framework for Rust.
//!
//! ## Features
//!
//! - Express-style routing with path parameters, named routes and groups
//! - Middleware support (logging, security, rate limiting, compression)
//! - Directive templates with layout inheritance and auto-escaping
//! - A fluent query builder with relationship loading
//! - Rule-driven request validation with redirect-back flash data
//! - Cookie-backed sessions with auth helpers
//! - Static files and downloads with HTTP Range support
//!
//! ## Quick Start
//!
//! ```rust
//! use arbor::app::Application;
//! use arbor::ok_json;
//!
//! fn main() {
//!     let mut app = Application::new();
//!
//!     // Add routes
//!     app.get("/", |_req| async {
//!         ok_json!({
//!             "message": "Hello, World!"
//!         })
//!     });
//!
//!     // Start server
//!     // app.listen("127.0.0.1:3000").unwrap();
//! }
//! ```
//!
//! ## Middleware Usage
//!
//! ```rust
//! use arbor::app::Application;
//! use arbor::middleware::{SecurityConfig, SecurityHeaders};
//!
//! let mut app = Application::new();
//! let security_config = SecurityConfig::default();
//! app.middleware(SecurityHeaders::new(security_config));
//! ```

pub mod app;
pub mod buffer;
pub mod cache;
pub mod database;
pub mod error;
pub mod handler;
pub mod http;
pub mod middleware;
pub mod plugins;
pub mod router;
pub mod session;
pub mod stream;
pub mod template;
pub mod validate;
pub extern crate serde_json;

// Reexport serde_json and the types almost every handler touches
pub use crate::app::Application;
pub use crate::error::{ServerError, ServerResult};
pub use crate::http::{Method, Outcome, Request, Response};
pub use crate::router::{Group, Router};
pub use crate::session::Session;
pub use crate::stream::FileStream;
pub use serde_json::{json, Value};
