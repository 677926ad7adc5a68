//! Application is the framework's entry point: it owns the router, the
//! typed plugin registry, the listener (plain or TLS) and the request
//! lifecycle — parse, session decode, dispatch through the middleware
//! chain, send, with one top-level error policy around the whole thing.
//!
//! # Examples
//!
//! ```rust
//! use arbor::app::Application;
//! use arbor::http::Response;
//!
//! let mut app = Application::new();
//! app.get("/", |_req| async { Ok(Response::text("Hello!")) });
//! ```

use crate::buffer::BufferPool;
use crate::database::{Db, Executor};
use crate::error::ServerError;
use crate::handler::{HttpResponse, IntoResponse};
use crate::http::{parse_cookie_header, Body, Cookie, Method, Request, Response};
use crate::middleware::Middleware;
use crate::plugins::Plugins;
use crate::router::{Group, Route, RouteMatch, Router};
use crate::session::{Session, SESSION_COOKIE};
use crate::stream::FileStream;
use crate::template::{Engine, Views};
use futures::FutureExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::io::{Error, ErrorKind};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_rustls::TlsAcceptor;

type ErrorHandler = Arc<dyn Fn(&ServerError) -> Response + Send + Sync>;

/// TLS configuration for HTTPS support
pub struct TlsConfig {
    cert_file: PathBuf,
    key_file: PathBuf,
}

impl TlsConfig {
    pub fn new<P: AsRef<Path>>(cert_file: P, key_file: P) -> Self {
        Self {
            cert_file: cert_file.as_ref().to_path_buf(),
            key_file: key_file.as_ref().to_path_buf(),
        }
    }

    fn load_certs(&self) -> Result<Vec<CertificateDer<'static>>, Box<dyn std::error::Error>> {
        let cert_file = File::open(&self.cert_file)?;
        let mut reader = StdBufReader::new(cert_file);
        let certs = rustls_pemfile::certs(&mut reader)
            .filter_map(|result| result.ok())
            .collect();
        Ok(certs)
    }

    fn load_key(&self) -> Result<PrivateKeyDer<'static>, Box<dyn std::error::Error>> {
        let key_file = File::open(&self.key_file)?;
        let mut reader = StdBufReader::new(key_file);
        let key = rustls_pemfile::private_key(&mut reader)?
            .ok_or_else(|| "No private key found")?;
        Ok(key)
    }
}

#[derive(Clone)]
pub struct Application {
    pub max_connections: usize,
    pub keep_alive: Duration,
    router: Router,
    static_dir: Option<PathBuf>,
    plugins: Plugins,
    on_error: Option<ErrorHandler>,
    tls_config: Option<Arc<TlsConfig>>,
    buffers: BufferPool,
    key: String,
    base_path: String,
    debug: bool,
    cookies_enabled: bool,
}

impl Application {
    /// Creates a new Application instance
    pub fn new() -> Self {
        Self {
            max_connections: 256,
            keep_alive: Duration::from_secs(5),
            router: Router::new(),
            static_dir: None,
            plugins: Plugins::new(),
            on_error: None,
            tls_config: None,
            buffers: BufferPool::default(),
            key: String::new(),
            base_path: String::new(),
            debug: false,
            cookies_enabled: true,
        }
    }

    pub fn max_connections(&mut self, max_connections: usize) -> &mut Self {
        self.max_connections = max_connections;
        self
    }

    pub fn keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// The application key sealing session cookies. Without one, sessions
    /// stay request-scoped.
    pub fn key<K: Into<String>>(&mut self, key: K) -> &mut Self {
        self.key = key.into();
        self
    }

    /// A base path prefix stripped from incoming URLs before routing, for
    /// applications mounted below the host root.
    pub fn base_path<P: Into<String>>(&mut self, base_path: P) -> &mut Self {
        self.base_path = base_path.into();
        self
    }

    /// Debug mode renders full error detail; off collapses database and
    /// internal errors to generic phrases.
    pub fn debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    /// Disable the session cookie entirely; sessions then live only for
    /// the duration of a request.
    pub fn without_cookies(&mut self) -> &mut Self {
        self.cookies_enabled = false;
        self
    }

    /// Register the template engine over a views directory.
    pub fn views<P: Into<PathBuf>>(&mut self, dir: P) -> &mut Self {
        self.plugins.insert(Views(Arc::new(Engine::new(dir.into()))));
        self
    }

    /// Register the database executor handlers and the `unik` validation
    /// rule resolve.
    pub fn database<E: Executor + 'static>(&mut self, executor: E) -> &mut Self {
        self.plugins.insert(Db::new(executor));
        self
    }

    pub fn plugins<T>(&mut self, plugin: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.plugins.insert(plugin);
        self
    }

    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&ServerError) -> Response + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Registers a GET route handler
    pub fn get<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.router.get(path, handler);
        self
    }

    /// Registers a POST route handler
    pub fn post<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.router.post(path, handler);
        self
    }

    /// Registers a PUT route handler
    pub fn put<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.router.put(path, handler);
        self
    }

    /// Registers a PATCH route handler
    pub fn patch<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.router.patch(path, handler);
        self
    }

    /// Registers a DELETE route handler
    pub fn delete<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.router.delete(path, handler);
        self
    }

    /// Registers an OPTIONS route handler
    pub fn options<F, R>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> R + Send + Clone + Sync + 'static,
        R: IntoResponse + 'static,
    {
        self.router.options(path, handler);
        self
    }

    /// Name the most recently registered route.
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.router.name(name);
        self
    }

    /// Attach a middleware layer to the most recently registered route.
    pub fn with(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.router.with(middleware);
        self
    }

    /// Adds a global middleware applied to routes registered afterwards.
    pub fn middleware(&mut self, middleware: impl Middleware + 'static) {
        self.router.middleware(middleware);
    }

    /// Register a group of routes sharing a prefix, name prefix and
    /// middleware.
    pub fn group<F>(&mut self, group: Group, body: F) -> &mut Self
    where
        F: FnOnce(&mut Router),
    {
        self.router.group(group, body);
        self
    }

    /// Reverse-resolve a named route into a URL.
    pub fn url_for(&self, name: &str, params: &HashMap<String, String>) -> Option<String> {
        self.router.url_for(name, params)
    }

    /// Configure TLS for HTTPS support
    pub fn with_tls<P: AsRef<Path>>(&mut self, cert_file: P, key_file: P) -> &mut Self {
        self.tls_config = Some(Arc::new(TlsConfig::new(cert_file, key_file)));
        self
    }

    /// Sets the directory for serving static files. Files are served
    /// through the byte-range responder, so Range requests and ETag
    /// revalidation work for anything under this directory.
    pub fn static_dir(&mut self, dir: &str) -> &mut Self {
        self.static_dir = Some(PathBuf::from(dir));
        self
    }

    /// Starts the HTTP server
    ///
    /// # Arguments
    /// * `addr` - Address to listen on (e.g. "127.0.0.1:3000")
    pub fn listen(self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let runtime = Runtime::new()?;
        runtime.block_on(async {
            let listener = TcpListener::bind(addr).await?;
            let connection_counter = Arc::new(AtomicUsize::new(0));

            println!("Server running on {}", if self.tls_config.is_some() {
                format!("https://{}", addr)
            } else {
                format!("http://{}", addr)
            });

            let tls_acceptor = if let Some(tls_config) = &self.tls_config {
                let certs = tls_config.load_certs()?;
                let key = tls_config.load_key()?;
                let config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)?;
                Some(TlsAcceptor::from(Arc::new(config)))
            } else {
                None
            };

            loop {
                let counter = Arc::clone(&connection_counter);
                if counter.load(Ordering::Relaxed) >= self.max_connections {
                    tracing::warn!("max connections reached");
                    continue;
                }

                match listener.accept().await {
                    Ok((stream, _)) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let app = self.clone();
                        let counter = Arc::clone(&counter);
                        let acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            let result = if let Some(acceptor) = acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => app.handle_connection(tls_stream).await,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "TLS handshake failed");
                                        Ok(())
                                    }
                                }
                            } else {
                                app.handle_connection(stream).await
                            };

                            if let Err(e) = result {
                                tracing::warn!(error = %e, "connection error");
                            }
                            counter.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "connection failed"),
                }
            }
        })
    }

    async fn handle_connection<S>(&self, mut stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf_reader = BufReader::new(&mut stream);
        let mut request_line = String::new();
        buf_reader.read_line(&mut request_line).await?;

        if request_line.is_empty() {
            return Ok(());
        }

        // Parse the request line
        let mut parts = request_line.trim().split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Invalid request line"))?
            .to_string();

        let full_path = parts
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Invalid request line"))?;

        // Split path and query, then strip the configured base path
        let mut path_parts = full_path.split('?');
        let raw_path = path_parts.next().unwrap_or("/");
        let path = Request::normalize_path(raw_path, &self.base_path);
        let path = path.trim_end_matches('/').to_string();
        let path = if path.is_empty() { "/".to_string() } else { path };
        let query = path_parts
            .next()
            .map(Self::parse_query)
            .unwrap_or_default();

        // Parse headers
        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            buf_reader.read_line(&mut line).await?;

            if line.trim().is_empty() {
                break;
            }

            if let Some((key, value)) = line.trim().split_once(':') {
                headers.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        // Read body if Content-Length is present
        let mut body = Vec::new();
        let content_type = headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "none".to_string());
        if let Some(content_length) = headers.get("content-length") {
            if let Ok(length) = content_length.parse::<usize>() {
                body.reserve(length);
                let mut take = buf_reader.take(length as u64);
                take.read_to_end(&mut body).await?;
            }
        }

        // Decode the session from its cookie; the kernel keeps a clone so
        // mutations made inside the handler survive to the Set-Cookie.
        let session = headers
            .get("cookie")
            .and_then(|header| {
                parse_cookie_header(header)
                    .into_iter()
                    .find(|(name, _)| name == SESSION_COOKIE)
            })
            .map(|(_, value)| Session::unseal(&value, &self.key))
            .unwrap_or_default();

        // Stream conditions have to outlive the request, which the handler
        // consumes.
        let range_header = headers.get("range").cloned();
        let if_none_match = headers.get("if-none-match").cloned();

        let mut request = Request {
            method: Method::from_string(&method),
            path,
            query,
            headers,
            body: Body {
                content_type,
                data: body,
            },
            input: serde_json::Map::new(),
            files: HashMap::new(),
            params: HashMap::new(),
            session: session.clone(),
            plugins: self.plugins.clone(),
        };
        request.finish();

        let response = AssertUnwindSafe(self.handle(request)).catch_unwind().await;
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let panic_msg = if let Some(msg) = err.downcast_ref::<&str>() {
                    msg.to_string()
                } else if let Some(msg) = err.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "Unknown panic".to_string()
                };
                Err(ServerError::PanicError(panic_msg))
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "request failed");
                self.render_error(&err)
            }
        };

        self.send_response(
            &mut stream,
            response,
            &session,
            range_header.as_deref(),
            if_none_match.as_deref(),
        )
        .await
    }

    /// Serialize one response to the wire. The session cookie and queued
    /// headers go out exactly once; redirects suppress the body; streams
    /// hand the socket to the byte-range responder.
    async fn send_response<S>(
        &self,
        stream: &mut S,
        mut response: Response,
        session: &Session,
        range_header: Option<&str>,
        if_none_match: Option<&str>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut cookie_lines: Vec<(String, String)> = Vec::new();
        if self.cookies_enabled && !self.key.is_empty() {
            let mut cookie = Cookie::new(SESSION_COOKIE, session.seal(&self.key));
            cookie.secure = self.tls_config.is_some();
            cookie_lines.push(("Set-Cookie".to_string(), cookie.to_string()));
        }
        for cookie in response.cookies.drain(..) {
            cookie_lines.push(("Set-Cookie".to_string(), cookie.to_string()));
        }

        if let Some(redirect) = response.redirect_to.take() {
            let mut head = self.buffers.get();
            head.extend_from_slice(response.status_line().as_bytes());
            head.extend_from_slice(format!("Location: {}\r\n", redirect.full_location()).as_bytes());
            for (name, value) in response.headers.iter() {
                head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
            }
            for (name, value) in &cookie_lines {
                head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
            }
            head.extend_from_slice(b"Content-Length: 0\r\n\r\n");
            stream.write_all(&head).await?;
            self.buffers.put(head);
            return Ok(());
        }

        if let Some(file_stream) = response.stream.take() {
            let mut extra: Vec<(String, String)> = response
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            extra.extend(cookie_lines);
            if let Err(err) = file_stream
                .send(range_header, if_none_match, &extra, stream)
                .await
            {
                tracing::debug!(error = %err, "stream terminated early");
            }
            return Ok(());
        }

        let mut head = self.buffers.get();
        head.extend_from_slice(response.status_line().as_bytes());
        for (name, value) in response.headers.iter() {
            head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        for (name, value) in &cookie_lines {
            head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        let body = match response.encoded.as_deref() {
            Some(encoded) => encoded,
            None => response.body.as_bytes(),
        };
        head.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        stream.write_all(&head).await?;
        stream.write_all(body).await?;
        self.buffers.put(head);
        Ok(())
    }

    async fn handle(&self, mut req: Request) -> HttpResponse {
        let method = req.method;
        let path = req.path.clone();

        match self.router.match_route(method, &path) {
            RouteMatch::Found { route, params } => {
                req.params = params;
                let route = route.clone();
                route.handle(req).await
            }
            RouteMatch::MethodNotAllowed(allow) => {
                // HEAD falls back to GET with the body stripped; OPTIONS
                // answers 200 through the route's middleware.
                if method == Method::HEAD || method == Method::OPTIONS {
                    if let RouteMatch::Found { route, params } =
                        self.router.match_route(Method::GET, &path)
                    {
                        req.params = params;
                        let route = route.clone();
                        return if method == Method::HEAD {
                            Self::handle_head(route, req).await
                        } else {
                            Self::handle_options(route, req).await
                        };
                    }
                }
                Err(ServerError::MethodNotAllowed(allow))
            }
            RouteMatch::NotFound => match self.open_static_file(&path).await {
                Some(stream) => Ok(Response::file(stream)),
                None => Err(ServerError::NotFound),
            },
        }
    }

    async fn handle_head(route: Route, req: Request) -> HttpResponse {
        let mut req = req;
        req.method = Method::GET;
        let response = route.handle(req).await;
        match response {
            Ok(mut response) => {
                response.body = String::new();
                response.encoded = None;
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_options(route: Route, req: Request) -> HttpResponse {
        let route = Route {
            handler: Box::new(|_| async { Ok(Response::new(200)) }),
            ..route
        };
        route.handle(req).await
    }

    /// Render an error through the user's hook, falling back to the
    /// built-in body if the hook itself panics — the client always gets a
    /// response.
    fn render_error(&self, error: &ServerError) -> Response {
        if let Some(handler) = &self.on_error {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(error))) {
                Ok(response) => return response,
                Err(_) => {
                    tracing::error!("error handler panicked; using fallback renderer");
                }
            }
        }
        Response::error(error, self.debug)
    }

    async fn open_static_file(&self, path: &str) -> Option<FileStream> {
        let static_dir = self.static_dir.as_ref()?;
        let file_path = static_dir.join(path.trim_start_matches('/'));
        let canonical_path = fs::canonicalize(&file_path).ok()?;
        if !canonical_path.starts_with(fs::canonicalize(static_dir).ok()?)
            || !canonical_path.is_file()
        {
            return None;
        }
        FileStream::open(&canonical_path).await.ok()
    }

    fn parse_query(query: &str) -> HashMap<String, String> {
        query
            .split('&')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| {
                let (key, value) = match pair.split_once('=') {
                    Some((key, value)) => (key, value),
                    None => (pair, ""),
                };
                Some((
                    urlencoding::decode(key).ok()?.into_owned(),
                    urlencoding::decode(value).ok()?.into_owned(),
                ))
            })
            .collect()
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}
