use crate::http::Request;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use std::io::Write;

#[derive(Clone)]
pub struct CompressionConfig {
    pub level: Compression,
    pub min_size: usize,
    pub skip_types: Vec<String>,
}

impl CompressionConfig {
    fn should_compress(&self, content_type: Option<&str>, content_length: usize) -> bool {
        if content_length < self.min_size {
            return false;
        }

        if let Some(ct) = content_type {
            for skip_type in &self.skip_types {
                if ct.starts_with(skip_type) {
                    return false;
                }
            }
        }

        true
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: Compression::default(),
            min_size: 1024,
            skip_types: vec![
                "image/".to_string(),
                "video/".to_string(),
                "audio/".to_string(),
                "application/pdf".to_string(),
                "application/zip".to_string(),
            ],
        }
    }
}

pub struct CompressionMiddleware {
    config: CompressionConfig,
}

impl CompressionMiddleware {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }
}

impl Middleware for CompressionMiddleware {
    fn call(&self, req: Request, next: Next) -> MiddlewareResult {
        let config = self.config.clone();
        Box::pin(async move {
            let accept_encoding = req.get_header("accept-encoding").map(|h| h.to_lowercase());

            let mut response = next.handle(req).await?;
            // Streams and redirects have no buffered body to compress.
            if response.stream.is_some() || response.is_redirect() {
                return Ok(response);
            }

            let content_type = response.headers.get("Content-Type").cloned();
            let should_compress =
                config.should_compress(content_type.as_deref(), response.body.len());

            if should_compress {
                if let Some(accepted) = accept_encoding {
                    let mut compressed = Vec::new();

                    if accepted.contains("gzip") {
                        let mut encoder = GzEncoder::new(Vec::new(), config.level);
                        encoder.write_all(response.body.as_bytes())?;
                        compressed = encoder.finish()?;
                        response.header("Content-Encoding", "gzip");
                    } else if accepted.contains("deflate") {
                        let mut encoder = DeflateEncoder::new(Vec::new(), config.level);
                        encoder.write_all(response.body.as_bytes())?;
                        compressed = encoder.finish()?;
                        response.header("Content-Encoding", "deflate");
                    }

                    if !compressed.is_empty() {
                        response.vary(&["Accept-Encoding"]);
                        response.encoded = Some(compressed);
                    }
                }
            }

            Ok(response)
        })
    }

    fn clone_box(&self) -> Box<dyn Middleware> {
        Box::new(Self::new(self.config.clone()))
    }
}
