use crate::database::Db;
use crate::http::Response;
use crate::plugins::Plugins;
use crate::session::Session;
use crate::validate::Validator;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Eq, Hash, PartialEq, Copy, Clone, Debug)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

impl Method {
    pub fn from_string(s: &str) -> Method {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "CONNECT" => Method::CONNECT,
            "OPTIONS" => Method::OPTIONS,
            "TRACE" => Method::TRACE,
            "PATCH" => Method::PATCH,
            _ => Method::GET,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::CONNECT => "CONNECT",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::PATCH => "PATCH",
        }
    }
}

/// A single uploaded file, normalized from the multipart body. Fields posted
/// as `photos[]` and plain `photo` both land as a `Vec<UploadedFile>` entry.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    /// Set when the upload was spooled to disk; removed on rejection.
    pub temp_path: Option<PathBuf>,
}

impl UploadedFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn extension(&self) -> Option<&str> {
        self.filename.rsplit_once('.').map(|(_, ext)| ext)
    }

    /// Remove the spooled copy. Called by the validator the moment a file
    /// rule fails.
    pub fn discard(&mut self) {
        if let Some(path) = self.temp_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Debug)]
pub struct Body {
    pub(crate) content_type: String,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum MultipartError {
    BoundaryNotFound,
    InvalidFormat,
    Utf8Error,
}

impl Body {
    pub fn new() -> Body {
        Body {
            content_type: String::new(),
            data: Vec::new(),
        }
    }

    pub fn from_string(s: &str) -> Body {
        Body {
            content_type: "text/plain".to_string(),
            data: s.as_bytes().to_vec(),
        }
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn json<T>(&self) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        if self.content_type.starts_with("application/json") {
            serde_json::from_slice(&self.data).ok()
        } else {
            None
        }
    }

    /// Form fields and uploads parsed out of the raw body. Urlencoded bodies
    /// produce fields only; multipart bodies split into fields and files.
    pub(crate) fn parse_form(&self) -> (Map<String, Value>, HashMap<String, Vec<UploadedFile>>) {
        if self.content_type.starts_with("application/x-www-form-urlencoded") {
            return (Self::parse_urlencoded(&self.data), HashMap::new());
        }
        if self.content_type.starts_with("multipart/form-data") {
            if let Ok(parsed) = Self::parse_multipart(&self.content_type, &self.data) {
                return parsed;
            }
        }
        (Map::new(), HashMap::new())
    }

    fn parse_urlencoded(data: &[u8]) -> Map<String, Value> {
        let data_str = String::from_utf8_lossy(data);
        let mut fields = Map::new();
        for pair in data_str.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                let key = match urlencoding::decode(key) {
                    Ok(k) => k.into_owned(),
                    Err(_) => continue,
                };
                let value = match urlencoding::decode(&value.replace('+', " ")) {
                    Ok(v) => v.into_owned(),
                    Err(_) => continue,
                };
                set_nested_value(&mut fields, &key, Value::String(value));
            }
        }
        fields
    }

    fn parse_multipart(
        content_type: &str,
        body: &[u8],
    ) -> Result<(Map<String, Value>, HashMap<String, Vec<UploadedFile>>), MultipartError> {
        let boundary = Self::extract_boundary(content_type)?;
        let delimiter = format!("--{boundary}");

        let parts = Self::split_body(body, &delimiter)?;
        let mut fields = Map::new();
        let mut files: HashMap<String, Vec<UploadedFile>> = HashMap::new();

        for part in parts {
            let (headers, content) = Self::split_headers_content(part)?;
            let headers = Self::parse_headers(headers)?;

            let name = match headers.get("name") {
                Some(name) => name.trim_matches('"').to_string(),
                None => continue,
            };

            if let Some(filename) = headers.get("filename") {
                let field = name.trim_end_matches("[]").to_string();
                files.entry(field.clone()).or_default().push(UploadedFile {
                    field,
                    filename: filename.trim_matches('"').to_string(),
                    content_type: headers
                        .get("content-type")
                        .cloned()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    data: content.to_vec(),
                    temp_path: None,
                });
            } else if let Ok(text) = String::from_utf8(content.to_vec()) {
                set_nested_value(&mut fields, &name, Value::String(text));
            }
        }

        Ok((fields, files))
    }

    fn extract_boundary(content_type: &str) -> Result<String, MultipartError> {
        content_type
            .split(';')
            .find_map(|s| s.trim().strip_prefix("boundary="))
            .map(|s| s.trim_matches('"').to_string())
            .ok_or(MultipartError::BoundaryNotFound)
    }

    fn split_body<'a>(body: &'a [u8], delimiter: &str) -> Result<Vec<&'a [u8]>, MultipartError> {
        let open = format!("{delimiter}\r\n").into_bytes();
        let sep = format!("\r\n{delimiter}").into_bytes();

        let start = Self::find_subsequence(body, &open)
            .map(|pos| pos + open.len())
            .ok_or(MultipartError::InvalidFormat)?;

        let mut parts = Vec::new();
        let mut cursor = start;
        while let Some(pos) = Self::find_subsequence(&body[cursor..], &sep) {
            parts.push(&body[cursor..cursor + pos]);
            cursor += pos + sep.len();
            // After the separator either a new part follows (\r\n) or the
            // terminator (--).
            if body[cursor..].starts_with(b"--") {
                break;
            }
            if body[cursor..].starts_with(b"\r\n") {
                cursor += 2;
            }
        }
        Ok(parts)
    }

    fn split_headers_content(part: &[u8]) -> Result<(&[u8], &[u8]), MultipartError> {
        let sep = b"\r\n\r\n";
        part.windows(sep.len())
            .position(|w| w == sep)
            .map(|pos| (&part[..pos], &part[pos + sep.len()..]))
            .ok_or(MultipartError::InvalidFormat)
    }

    fn parse_headers(headers: &[u8]) -> Result<HashMap<String, String>, MultipartError> {
        let mut map = HashMap::new();
        let headers_str = std::str::from_utf8(headers).map_err(|_| MultipartError::Utf8Error)?;

        for line in headers_str.split("\r\n") {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim().trim_matches('"');

                if key == "content-disposition" {
                    for param in value.split(';').skip(1) {
                        if let Some((k, v)) = param.trim().split_once('=') {
                            map.insert(k.to_string(), v.to_string());
                        }
                    }
                } else {
                    map.insert(key, value.to_string());
                }
            }
        }

        Ok(map)
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Body {
        Body {
            content_type: "application/octet-stream".to_string(),
            data,
        }
    }
}

/// Insert a form value under a possibly-nested key like `user[address][city]`
/// or `tags[]`. Intermediate containers are created as needed.
fn set_nested_value(map: &mut Map<String, Value>, key: &str, value: Value) {
    let mut segments: Vec<&str> = Vec::new();
    let mut rest = key;
    if let Some(bracket) = rest.find('[') {
        segments.push(&rest[..bracket]);
        rest = &rest[bracket..];
        while let Some(close) = rest.find(']') {
            segments.push(&rest[1..close]);
            rest = &rest[close + 1..];
        }
    } else {
        segments.push(rest);
    }
    if segments[0].is_empty() {
        return;
    }

    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value);
        return;
    }
    let root = map
        .entry(segments[0].to_string())
        .or_insert(Value::Null);
    insert_path(root, &segments[1..], value);
}

fn insert_path(target: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    if head.is_empty() || head.parse::<usize>().is_ok() {
        // Array segment: `[]` appends, `[n]` indexes.
        if !target.is_array() {
            *target = Value::Array(Vec::new());
        }
        let items = target.as_array_mut().expect("just coerced to array");
        let index = match head.parse::<usize>() {
            Ok(n) => {
                while items.len() <= n {
                    items.push(Value::Null);
                }
                n
            }
            Err(_) => {
                items.push(Value::Null);
                items.len() - 1
            }
        };
        insert_path(&mut items[index], rest, value);
    } else {
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        let fields = target.as_object_mut().expect("just coerced to object");
        let slot = fields.entry(head.to_string()).or_insert(Value::Null);
        insert_path(slot, rest, value);
    }
}

/// Result of `Request::validate`. Validation failure is request control flow
/// (go back with flash data, or answer 422 JSON), never an error.
pub enum Outcome {
    Continue(Map<String, Value>),
    Redirect(Response),
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    /// Form/urlencoded fields merged with a decoded JSON body; the JSON body
    /// wins on key collision.
    pub input: Map<String, Value>,
    pub files: HashMap<String, Vec<UploadedFile>>,
    pub body: Body,
    pub session: Session,
    pub plugins: Plugins,
}

impl Request {
    /// Build the input bag and file bag: query parameters, then form
    /// fields, then the decoded JSON body — later sources win on key
    /// collision. Afterwards the HTML-form method override applies.
    pub(crate) fn finish(&mut self) {
        let (form, files) = self.body.parse_form();
        let mut input: Map<String, Value> = self
            .query
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        for (key, value) in form {
            input.insert(key, value);
        }
        if let Some(Value::Object(json)) = self.body.json::<Value>() {
            for (key, value) in json {
                input.insert(key, value);
            }
        }
        self.input = input;
        self.files = files;

        // HTML forms can only submit GET/POST; a `_method` field emulates
        // PUT/PATCH/DELETE. Fetch-style clients send the real verb.
        if self.method == Method::POST && !self.is_ajax() {
            if let Some(Value::String(spoofed)) = self.input.get("_method") {
                match spoofed.to_ascii_uppercase().as_str() {
                    "PUT" => self.method = Method::PUT,
                    "PATCH" => self.method = Method::PATCH,
                    "DELETE" => self.method = Method::DELETE,
                    _ => {}
                }
            }
        }
    }

    /// Strip a configured base path from a raw request target. Missing
    /// prefix falls back to the raw path unchanged.
    pub(crate) fn normalize_path(raw: &str, base_path: &str) -> String {
        if base_path.is_empty() || base_path == "/" {
            return raw.to_string();
        }
        match raw.strip_prefix(base_path) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => raw.to_string(),
        }
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    pub fn get_method(&self) -> &Method {
        &self.method
    }

    /// A single input field, form or JSON.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.input.get(key)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(|v| v.as_str())
    }

    pub fn file(&self, key: &str) -> Option<&UploadedFile> {
        self.files.get(key).and_then(|list| list.first())
    }

    pub fn is_ajax(&self) -> bool {
        self.get_header("x-requested-with")
            .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
            .unwrap_or(false)
    }

    /// JSON error bodies for fetch-style clients, redirects for forms.
    pub fn wants_json(&self) -> bool {
        if self.is_ajax() {
            return true;
        }
        self.get_header("accept")
            .map(|accept| accept.starts_with("application/json"))
            .unwrap_or(false)
    }

    fn previous_url(&self) -> String {
        self.get_header("referer")
            .map(|r| r.to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Run the validator over exactly the named fields, pulling each from
    /// the file bag first and the input bag second.
    ///
    /// On failure the errors and old input are flashed to the session and a
    /// redirect back to the previous URL is returned (a 422 JSON body for
    /// AJAX clients). The caller matches on the outcome; nothing is thrown.
    pub fn validate(&mut self, rules: &[(&str, &str)]) -> Outcome {
        let mut data = Map::new();
        let mut files: HashMap<String, Vec<UploadedFile>> = HashMap::new();
        for (field, _) in rules {
            if let Some(list) = self.files.get(*field) {
                files.insert(field.to_string(), list.clone());
            } else if let Some(value) = self.input.get(*field) {
                data.insert(field.to_string(), value.clone());
            }
        }

        let executor = self.plugins.get::<Db>().map(|db| db.clone());
        let mut validator = Validator::new(data, files);
        if let Some(db) = executor {
            validator = validator.with_executor(db);
        }

        match validator.run(rules) {
            Ok(validated) => Outcome::Continue(validated),
            Err(errors) => {
                if self.wants_json() {
                    let mut response = Response::new(422);
                    response
                        .json(&serde_json::json!({ "errors": errors }))
                        .expect("Error creating JSON response");
                    return Outcome::Redirect(response);
                }
                let old: Map<String, Value> = rules
                    .iter()
                    .filter_map(|(field, _)| {
                        self.input
                            .get(*field)
                            .map(|v| (field.to_string(), v.clone()))
                    })
                    .collect();
                self.session.flash("errors", serde_json::json!(errors));
                self.session.flash("old", Value::Object(old));
                Outcome::Redirect(Response::redirect(self.previous_url()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_request(method: Method) -> Request {
        Request {
            method,
            path: "/".to_string(),
            query: HashMap::new(),
            params: HashMap::new(),
            headers: HashMap::new(),
            input: Map::new(),
            files: HashMap::new(),
            body: Body::new(),
            session: Session::new(),
            plugins: Plugins::new(),
        }
    }

    #[test]
    fn json_body_wins_over_query_parameters() {
        let mut req = bare_request(Method::POST);
        req.query
            .insert("name".to_string(), "from-query".to_string());
        req.query
            .insert("page".to_string(), "2".to_string());
        req.body = Body {
            content_type: "application/json".to_string(),
            data: br#"{"name":"from-json"}"#.to_vec(),
        };
        req.finish();
        assert_eq!(req.input_str("name"), Some("from-json"));
        assert_eq!(req.input_str("page"), Some("2"));
    }

    #[test]
    fn method_override_applies_to_form_posts_only() {
        let mut req = bare_request(Method::POST);
        req.body = Body {
            content_type: "application/x-www-form-urlencoded".to_string(),
            data: b"_method=DELETE&id=3".to_vec(),
        };
        req.finish();
        assert_eq!(req.method, Method::DELETE);

        let mut ajax = bare_request(Method::POST);
        ajax.headers.insert(
            "x-requested-with".to_string(),
            "XMLHttpRequest".to_string(),
        );
        ajax.body = Body {
            content_type: "application/x-www-form-urlencoded".to_string(),
            data: b"_method=DELETE".to_vec(),
        };
        ajax.finish();
        assert_eq!(ajax.method, Method::POST);
    }

    #[test]
    fn base_path_is_stripped() {
        assert_eq!(Request::normalize_path("/app/users", "/app"), "/users");
        assert_eq!(Request::normalize_path("/app", "/app"), "/");
        // Unexpected prefix falls back to the raw path.
        assert_eq!(Request::normalize_path("/other/users", "/app"), "/other/users");
    }

    #[test]
    fn urlencoded_nested_keys() {
        let body = Body {
            content_type: "application/x-www-form-urlencoded".to_string(),
            data: b"user%5Bname%5D=ada&tags%5B%5D=a&tags%5B%5D=b".to_vec(),
        };
        let (fields, _) = body.parse_form();
        assert_eq!(fields["user"]["name"], "ada");
        assert_eq!(fields["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn multipart_splits_fields_and_files() {
        let body_bytes = b"--XBOUND\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\r\n\
hello\r\n\
--XBOUND\r\n\
Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
file-bytes\r\n\
--XBOUND--\r\n";
        let body = Body {
            content_type: "multipart/form-data; boundary=XBOUND".to_string(),
            data: body_bytes.to_vec(),
        };
        let (fields, files) = body.parse_form();
        assert_eq!(fields["title"], "hello");
        let doc = &files["doc"][0];
        assert_eq!(doc.filename, "a.txt");
        assert_eq!(doc.data, b"file-bytes");
        assert_eq!(doc.content_type, "text/plain");
    }

    #[test]
    fn array_file_fields_normalize_to_one_bag() {
        let body_bytes = b"--B\r\n\
Content-Disposition: form-data; name=\"photos[]\"; filename=\"1.png\"\r\n\r\n\
one\r\n\
--B\r\n\
Content-Disposition: form-data; name=\"photos[]\"; filename=\"2.png\"\r\n\r\n\
two\r\n\
--B--\r\n";
        let body = Body {
            content_type: "multipart/form-data; boundary=B".to_string(),
            data: body_bytes.to_vec(),
        };
        let (_, files) = body.parse_form();
        assert_eq!(files["photos"].len(), 2);
        assert_eq!(files["photos"][1].filename, "2.png");
    }
}
