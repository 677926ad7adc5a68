use crate::error::ServerError;
use crate::http::cookie::Cookie;
use crate::http::status::reason_phrase;
use crate::stream::FileStream;
use serde::Serialize;
use std::collections::HashMap;

/// Redirect target plus optional query-string parameters appended at send
/// time.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub location: String,
    pub query: Vec<(String, String)>,
}

impl Redirect {
    pub fn full_location(&self) -> String {
        if self.query.is_empty() {
            return self.location.clone();
        }
        let query: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        let sep = if self.location.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.location, sep, query.join("&"))
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub(crate) cookies: Vec<Cookie>,
    pub(crate) redirect_to: Option<Redirect>,
    pub(crate) stream: Option<FileStream>,
    /// Set by the compression middleware; sent in place of `body`.
    pub(crate) encoded: Option<Vec<u8>>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: HashMap::new(),
            body: String::new(),
            cookies: Vec::new(),
            redirect_to: None,
            stream: None,
            encoded: None,
        }
    }

    // Chainable status setter
    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    /// Replace the body.
    pub fn body<T: AsRef<str>>(&mut self, body: T) -> &mut Self {
        self.body = body.as_ref().to_string();
        self
    }

    /// Append to the body. The buffer only ever grows; send happens once.
    pub fn write<T: AsRef<str>>(&mut self, chunk: T) -> &mut Self {
        self.body.push_str(chunk.as_ref());
        self
    }

    pub fn header<K: AsRef<str>, V: AsRef<str>>(&mut self, name: K, value: V) -> &mut Self {
        self.headers
            .insert(name.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    pub fn headers(&mut self, headers: HashMap<String, String>) -> &mut Self {
        self.headers.extend(headers);
        self
    }

    pub fn cookie(&mut self, cookie: Cookie) -> &mut Self {
        self.cookies.push(cookie);
        self
    }

    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<&mut Self, ServerError> {
        let json_string = serde_json::to_string(value)
            .map_err(|e| ServerError::InternalError(format!("JSON serialization error: {}", e)))?;
        self.header("Content-Type", "application/json");
        self.body(json_string);
        Ok(self)
    }

    pub fn status_line(&self) -> String {
        let phrase = reason_phrase(self.status);
        if phrase.is_empty() {
            format!("HTTP/1.1 {}\r\n", self.status)
        } else {
            format!("HTTP/1.1 {} {}\r\n", self.status, phrase)
        }
    }

    // Static constructors for common responses

    pub fn ok<T: Serialize>(data: &T) -> Result<Response, ServerError> {
        let mut response = Response::new(200);
        response.json(data)?;
        Ok(response)
    }

    pub fn created<T: Serialize>(data: &T) -> Result<Response, ServerError> {
        let mut response = Response::new(201);
        response.json(data)?;
        Ok(response)
    }

    pub fn no_content() -> Response {
        Response::new(204)
    }

    pub fn text<T: AsRef<str>>(content: T) -> Response {
        let mut response = Response::new(200);
        response
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(content);
        response
    }

    pub fn html<T: AsRef<str>>(content: T) -> Response {
        let mut response = Response::new(200);
        response
            .header("Content-Type", "text/html; charset=utf-8")
            .body(content);
        response
    }

    /// A 302 redirect. Body content set elsewhere is ignored at send time;
    /// only the Location header goes out.
    pub fn redirect<L: Into<String>>(location: L) -> Response {
        let mut response = Response::new(302);
        response.redirect_to = Some(Redirect {
            location: location.into(),
            query: Vec::new(),
        });
        response
    }

    pub fn permanent_redirect<L: Into<String>>(location: L) -> Response {
        let mut response = Response::redirect(location);
        response.status = 301;
        response
    }

    /// Append a query parameter to a pending redirect. No-op on plain
    /// responses.
    pub fn with_query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Response {
        if let Some(redirect) = self.redirect_to.as_mut() {
            redirect.query.push((key.into(), value.into()));
        }
        self
    }

    /// Stream a file through the byte-range responder instead of a buffered
    /// body.
    pub fn file(stream: FileStream) -> Response {
        let mut response = Response::new(200);
        response.stream = Some(stream);
        response
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect_to.is_some()
    }

    pub fn method_not_allowed(allowed_methods: &[&str]) -> Response {
        let mut response = Response::new(405);
        response
            .header("Allow", allowed_methods.join(", "))
            .json(&serde_json::json!({
                "error": {
                    "message": "Method not allowed",
                    "allowed_methods": allowed_methods
                }
            }))
            .expect("Error creating JSON response");
        response
    }

    // Enhanced error response
    pub fn error(err: &ServerError, debug: bool) -> Response {
        let status = err.status_code();
        let message = if debug {
            err.to_string()
        } else {
            err.public_message()
        };
        let mut response = Response::new(status);
        if let ServerError::MethodNotAllowed(allow) = err {
            let allow: Vec<&str> = allow.iter().map(|m| m.as_str()).collect();
            response.header("Allow", allow.join(", "));
        }
        if let ServerError::UnsatisfiableRange { size } = err {
            response.header("Content-Range", format!("bytes */{}", size));
        }
        response
            .json(&serde_json::json!({
                "error": {
                    "message": message,
                    "status": status
                }
            }))
            .expect("Error creating JSON response");
        response
    }

    pub fn with_cache_control(&mut self, directive: &str) -> &mut Self {
        self.header("Cache-Control", directive)
    }

    pub fn no_cache(&mut self) -> &mut Self {
        self.with_cache_control("no-cache, no-store, must-revalidate")
            .header("Pragma", "no-cache")
            .header("Expires", "0")
    }

    pub fn file_download(&mut self, filename: &str, content_type: &str) -> &mut Self {
        self.header("Content-Type", content_type).header(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename),
        )
    }

    pub fn vary(&mut self, headers: &[&str]) -> &mut Self {
        self.header("Vary", headers.join(", "))
    }
}

#[macro_export]
macro_rules! ok_json {
    ($($json:tt)+) => {{
        let mut response = $crate::http::Response::new(200);
        response.json(&$crate::json!($($json)+))?;
        Ok(response)
    }};
}

#[macro_export]
macro_rules! created_json {
    ($($json:tt)+) => {{
        let mut response = $crate::http::Response::new(201);
        response.json(&$crate::json!($($json)+))?;
        Ok(response)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_location_appends_query() {
        let response = Response::redirect("/login")
            .with_query("next", "/admin")
            .with_query("note", "a b");
        let redirect = response.redirect_to.as_ref().unwrap();
        assert_eq!(redirect.full_location(), "/login?next=%2Fadmin&note=a%20b");
    }

    #[test]
    fn redirect_location_respects_existing_query() {
        let response = Response::redirect("/search?q=x").with_query("page", "2");
        let redirect = response.redirect_to.as_ref().unwrap();
        assert_eq!(redirect.full_location(), "/search?q=x&page=2");
    }

    #[test]
    fn body_accumulates() {
        let mut response = Response::new(200);
        response.write("a").write("b").write("c");
        assert_eq!(response.body, "abc");
    }

    #[test]
    fn status_line_uses_reason_phrase() {
        assert_eq!(Response::new(404).status_line(), "HTTP/1.1 404 Not Found\r\n");
        assert_eq!(Response::new(299).status_line(), "HTTP/1.1 299\r\n");
    }

    #[test]
    fn error_response_hides_database_detail() {
        let err = ServerError::Database {
            message: "relation users does not exist".to_string(),
            sql: Some("SELECT * FROM users".to_string()),
        };
        let public = Response::error(&err, false);
        assert_eq!(public.status, 503);
        assert!(!public.body.contains("users"));
    }
}
