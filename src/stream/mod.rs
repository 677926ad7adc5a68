//! Byte-range file responder.
//!
//! A [`FileStream`] walks `Created → Initialized → RangeClassified →
//! Streaming → Terminated`: the ETag is checked first (304 short-circuits),
//! the `Range` header is classified (none / one / many), and the body is
//! copied in small flushed chunks so a client can start consuming
//! immediately and disconnect mid-transfer without tying up the worker.

use crate::error::{ServerError, ServerResult};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// Copy granularity. Small on purpose: every chunk is flushed so download
/// progress is visible and disconnects are noticed quickly.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Created,
    Initialized,
    Streaming,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RangeClass {
    None,
    Single(ByteRange),
    Multi(Vec<ByteRange>),
}

#[derive(Debug)]
pub struct FileStream {
    file: File,
    path: PathBuf,
    pub size: u64,
    pub mime: &'static str,
    pub etag: String,
    download: bool,
    boundary: String,
    state: StreamState,
}

impl FileStream {
    pub async fn open<P: AsRef<Path>>(path: P) -> ServerResult<FileStream> {
        Self::build(path, false).await
    }

    /// Download mode: attachment disposition and a random ETag, so no
    /// revalidation short-circuits the transfer.
    pub async fn download<P: AsRef<Path>>(path: P) -> ServerResult<FileStream> {
        Self::build(path, true).await
    }

    async fn build<P: AsRef<Path>>(path: P, download: bool) -> ServerResult<FileStream> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;

        let etag = if download {
            random_token()
        } else {
            // Hash of identity + size + mtime: a stable opaque validator
            // without re-reading the file on every request.
            let mut hasher = Sha256::new();
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(metadata.len().to_le_bytes());
            if let Ok(modified) = metadata.modified() {
                if let Ok(age) = modified.duration_since(std::time::UNIX_EPOCH) {
                    hasher.update(age.as_nanos().to_le_bytes());
                }
            }
            hex(&hasher.finalize()[..16])
        };

        Ok(FileStream {
            file,
            size: metadata.len(),
            mime: mime_for(&path),
            etag,
            download,
            boundary: random_token(),
            state: StreamState::Created,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the full respond cycle against `writer`: status line, headers
    /// (plus `extra` — the kernel passes the session cookie through here),
    /// then the classified body. Consumes the stream; it sends exactly once.
    pub async fn send<W>(
        mut self,
        range_header: Option<&str>,
        if_none_match: Option<&str>,
        extra: &[(String, String)],
        writer: &mut W,
    ) -> ServerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.state = StreamState::Initialized;

        // Clients echo the ETag quoted; compare the opaque value only.
        let if_none_match = if_none_match.map(|v| v.trim().trim_matches('"'));
        if !self.download && if_none_match == Some(self.etag.as_str()) {
            let head = format!(
                "HTTP/1.1 304 Not Modified\r\nETag: \"{}\"\r\n{}\r\n",
                self.etag,
                render_headers(extra)
            );
            writer.write_all(head.as_bytes()).await?;
            writer.flush().await?;
            self.state = StreamState::Terminated;
            return Ok(());
        }

        let class = match classify_ranges(range_header, self.size) {
            Ok(class) => class,
            Err(err) => {
                // 416 terminates immediately, no body.
                let head = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\n{}\r\n",
                    self.size,
                    render_headers(extra)
                );
                writer.write_all(head.as_bytes()).await?;
                writer.flush().await?;
                self.state = StreamState::Terminated;
                return Err(err);
            }
        };

        let mut common = format!(
            "Accept-Ranges: bytes\r\nETag: \"{}\"\r\n{}",
            self.etag,
            render_headers(extra)
        );
        if self.download {
            let filename = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string());
            common.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n",
                filename
            ));
        }

        self.state = StreamState::Streaming;
        let result = match class {
            RangeClass::None => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n{}\r\n",
                    self.mime, self.size, common
                );
                writer.write_all(head.as_bytes()).await?;
                let full = ByteRange {
                    start: 0,
                    end: self.size.saturating_sub(1),
                };
                if self.size == 0 {
                    writer.flush().await?;
                    Ok(())
                } else {
                    copy_range(&mut self.file, full, writer).await
                }
            }
            RangeClass::Single(range) => {
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Type: {}\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}\r\n",
                    self.mime,
                    range.len(),
                    range.start,
                    range.end,
                    self.size,
                    common
                );
                writer.write_all(head.as_bytes()).await?;
                copy_range(&mut self.file, range, writer).await
            }
            RangeClass::Multi(ranges) => {
                let total = multipart_length(&ranges, self.mime, &self.boundary, self.size);
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Type: multipart/byteranges; boundary={}\r\nContent-Length: {}\r\n{}\r\n",
                    self.boundary, total, common
                );
                writer.write_all(head.as_bytes()).await?;
                let mut outcome = Ok(());
                for range in &ranges {
                    let part = part_header(range, self.mime, &self.boundary, self.size);
                    if let Err(err) = writer.write_all(part.as_bytes()).await {
                        outcome = Err(err.into());
                        break;
                    }
                    if let Err(err) = copy_range(&mut self.file, *range, writer).await {
                        outcome = Err(err);
                        break;
                    }
                }
                if outcome.is_ok() {
                    writer
                        .write_all(format!("\r\n--{}--\r\n", self.boundary).as_bytes())
                        .await?;
                    writer.flush().await?;
                }
                outcome
            }
        };

        self.state = StreamState::Terminated;
        match result {
            Ok(()) => Ok(()),
            // A failed write means the client went away; cancel quietly.
            Err(ServerError::IoError(err)) => {
                tracing::debug!(path = %self.path.display(), error = %err, "client disconnected mid-stream");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}

/// Seek and copy exactly the range, one flushed chunk at a time.
async fn copy_range<W>(file: &mut File, range: ByteRange, writer: &mut W) -> ServerResult<()>
where
    W: AsyncWrite + Unpin,
{
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut remaining = range.len();
    let mut buf = [0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        writer.flush().await?;
        remaining -= read as u64;
    }
    Ok(())
}

/// Classify the `Range` header. Absent → full file. Unsatisfiable →
/// `UnsatisfiableRange`, which the sender turns into a 416.
pub(crate) fn classify_ranges(header: Option<&str>, size: u64) -> ServerResult<RangeClass> {
    let Some(header) = header else {
        return Ok(RangeClass::None);
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(RangeClass::None);
    };

    let mut ranges = Vec::new();
    for part in spec.split(',') {
        ranges.push(parse_range(part.trim(), size)?);
    }
    match ranges.len() {
        0 => Err(ServerError::UnsatisfiableRange { size }),
        1 => Ok(RangeClass::Single(ranges[0])),
        _ => Ok(RangeClass::Multi(ranges)),
    }
}

fn parse_range(part: &str, size: u64) -> ServerResult<ByteRange> {
    let unsat = || ServerError::UnsatisfiableRange { size };
    let Some((start, end)) = part.split_once('-') else {
        return Err(unsat());
    };
    if size == 0 {
        return Err(unsat());
    }

    let range = match (start, end) {
        // Suffix form `-N`: the last N bytes, clamped to the file.
        ("", suffix) => {
            let n: u64 = suffix.parse().map_err(|_| unsat())?;
            if n == 0 {
                return Err(unsat());
            }
            ByteRange {
                start: size.saturating_sub(n),
                end: size - 1,
            }
        }
        // Open end `S-`: from S to the last byte.
        (start, "") => ByteRange {
            start: start.parse().map_err(|_| unsat())?,
            end: size - 1,
        },
        (start, end) => {
            let start: u64 = start.parse().map_err(|_| unsat())?;
            let end: u64 = end.parse().map_err(|_| unsat())?;
            if end < start {
                // An end below the start reads as a suffix request: serve
                // the last `end` bytes.
                if end == 0 {
                    return Err(ServerError::UnsatisfiableRange { size });
                }
                ByteRange {
                    start: size.saturating_sub(end),
                    end: size - 1,
                }
            } else {
                ByteRange {
                    start,
                    end: end.min(size - 1),
                }
            }
        }
    };

    if range.start >= size {
        return Err(ServerError::UnsatisfiableRange { size });
    }
    Ok(range)
}

fn part_header(range: &ByteRange, mime: &str, boundary: &str, size: u64) -> String {
    format!(
        "\r\n--{}\r\nContent-Type: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
        boundary, mime, range.start, range.end, size
    )
}

/// Total multipart body length, computed before any byte is sent so the
/// response can carry an exact `Content-Length`.
pub(crate) fn multipart_length(ranges: &[ByteRange], mime: &str, boundary: &str, size: u64) -> u64 {
    let mut total = 0u64;
    for range in ranges {
        total += part_header(range, mime, boundary, size).len() as u64;
        total += range.len();
    }
    total + format!("\r\n--{}--\r\n", boundary).len() as u64
}

fn render_headers(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}\r\n", name, value))
        .collect()
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Extension-based MIME lookup for served files.
pub(crate) fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content).expect("write");
        file.flush().expect("flush");
        file
    }

    async fn send_collect(
        stream: FileStream,
        range: Option<&str>,
        if_none_match: Option<&str>,
    ) -> (ServerResult<()>, String) {
        let mut sink = Cursor::new(Vec::new());
        let result = stream.send(range, if_none_match, &[], &mut sink).await;
        (result, String::from_utf8_lossy(&sink.into_inner()).into_owned())
    }

    #[test]
    fn range_classification() {
        assert_eq!(classify_ranges(None, 100).unwrap(), RangeClass::None);
        assert_eq!(
            classify_ranges(Some("bytes=0-0"), 100).unwrap(),
            RangeClass::Single(ByteRange { start: 0, end: 0 })
        );
        assert_eq!(
            classify_ranges(Some("bytes=0-9,20-29"), 100).unwrap(),
            RangeClass::Multi(vec![
                ByteRange { start: 0, end: 9 },
                ByteRange { start: 20, end: 29 }
            ])
        );
    }

    #[test]
    fn suffix_and_open_ranges_normalize() {
        // Last 10 bytes.
        assert_eq!(
            parse_range("-10", 100).unwrap(),
            ByteRange { start: 90, end: 99 }
        );
        // Suffix longer than the file clamps to the whole file.
        assert_eq!(
            parse_range("-500", 100).unwrap(),
            ByteRange { start: 0, end: 99 }
        );
        // Open end runs to the last byte.
        assert_eq!(
            parse_range("40-", 100).unwrap(),
            ByteRange { start: 40, end: 99 }
        );
        // End past the file clamps.
        assert_eq!(
            parse_range("90-1000", 100).unwrap(),
            ByteRange { start: 90, end: 99 }
        );
        // Inverted pair reads as a suffix of `end` bytes.
        assert_eq!(
            parse_range("80-20", 100).unwrap(),
            ByteRange { start: 80, end: 99 }
        );
    }

    #[test]
    fn start_beyond_size_is_unsatisfiable() {
        assert!(matches!(
            parse_range("100-", 100),
            Err(ServerError::UnsatisfiableRange { size: 100 })
        ));
        assert!(matches!(
            parse_range("500-600", 100),
            Err(ServerError::UnsatisfiableRange { .. })
        ));
    }

    #[test]
    fn multipart_length_matches_rendered_parts() {
        let ranges = vec![ByteRange { start: 0, end: 4 }, ByteRange { start: 10, end: 14 }];
        let expected = part_header(&ranges[0], "text/plain", "B", 20).len() as u64
            + 5
            + part_header(&ranges[1], "text/plain", "B", 20).len() as u64
            + 5
            + "\r\n--B--\r\n".len() as u64;
        assert_eq!(multipart_length(&ranges, "text/plain", "B", 20), expected);
    }

    #[tokio::test]
    async fn full_file_send() {
        let file = temp_file(b"hello world");
        let stream = FileStream::open(file.path()).await.unwrap();
        let (result, out) = send_collect(stream, None, None).await;
        result.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 11\r\n"));
        assert!(out.contains("Accept-Ranges: bytes\r\n"));
        assert!(out.ends_with("hello world"));
    }

    #[tokio::test]
    async fn single_byte_range() {
        let file = temp_file(b"abcdefghij");
        let stream = FileStream::open(file.path()).await.unwrap();
        let (result, out) = send_collect(stream, Some("bytes=0-0"), None).await;
        result.unwrap();
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(out.contains("Content-Range: bytes 0-0/10\r\n"));
        assert!(out.contains("Content-Length: 1\r\n"));
        assert!(out.ends_with("a"));
    }

    #[tokio::test]
    async fn suffix_range_returns_tail() {
        let file = temp_file(b"abcdefghij");
        let stream = FileStream::open(file.path()).await.unwrap();
        let (result, out) = send_collect(stream, Some("bytes=-3"), None).await;
        result.unwrap();
        assert!(out.contains("Content-Range: bytes 7-9/10\r\n"));
        assert!(out.ends_with("hij"));
    }

    #[tokio::test]
    async fn multi_range_emits_byteranges_body() {
        let file = temp_file(b"abcdefghij");
        let stream = FileStream::open(file.path()).await.unwrap();
        let boundary = stream.boundary.clone();
        let (result, out) = send_collect(stream, Some("bytes=0-1,8-9"), None).await;
        result.unwrap();
        assert!(out.contains(&format!(
            "Content-Type: multipart/byteranges; boundary={}",
            boundary
        )));
        assert!(out.contains("Content-Range: bytes 0-1/10"));
        assert!(out.contains("Content-Range: bytes 8-9/10"));
        assert!(out.contains("ab"));
        assert!(out.contains("ij"));
        assert!(out.trim_end().ends_with(&format!("--{}--", boundary)));

        // The advertised Content-Length matches the body actually written.
        let body_start = out.find("\r\n\r\n").unwrap() + 4;
        let advertised: usize = out
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(out.len() - body_start, advertised);
    }

    #[tokio::test]
    async fn unsatisfiable_range_sends_416() {
        let file = temp_file(b"abcdefghij");
        let stream = FileStream::open(file.path()).await.unwrap();
        let (result, out) = send_collect(stream, Some("bytes=50-60"), None).await;
        assert!(matches!(
            result,
            Err(ServerError::UnsatisfiableRange { size: 10 })
        ));
        assert!(out.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
        assert!(out.contains("Content-Range: bytes */10\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn matching_etag_sends_304_without_body() {
        let file = temp_file(b"abcdefghij");
        let stream = FileStream::open(file.path()).await.unwrap();
        let etag = stream.etag.clone();
        let (result, out) = send_collect(stream, None, Some(etag.as_str())).await;
        result.unwrap();
        assert!(out.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn download_mode_ignores_etag_and_attaches() {
        let file = temp_file(b"abcdefghij");
        let stream = FileStream::download(file.path()).await.unwrap();
        let etag = stream.etag.clone();
        let (result, out) = send_collect(stream, None, Some(etag.as_str())).await;
        result.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Disposition: attachment;"));
    }
}
