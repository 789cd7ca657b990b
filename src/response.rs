//! Response parsing and entity decoding.
//!
//! [`ResponseParser`] consumes the reply bytes of one request: status line,
//! header block, body framing (`Content-Length`, chunked, or read to end of
//! stream), `Content-Encoding` reversal, and finally decoding of the body
//! into an [`Entity`] according to its media type.

use std::io::{self, BufRead, BufReader, Read};

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};
use crate::types::{HeaderMap, Method};

/// Charset reported when the content type does not name one.
pub const DEFAULT_CHARSET: &str = "ISO-8859-1";

/// Upper bound on a header block, status line excluded.
pub(crate) const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Parsed `HTTP-version status-code reason-phrase` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

/// Parse a status line. The reason phrase may contain spaces and may be
/// empty.
pub fn parse_status_line(line: &str) -> Result<StatusLine> {
    let mut tokens = line.split_whitespace();
    let version = tokens
        .next()
        .ok_or_else(|| ClientError::ProtocolParse("Empty status line".to_string()))?;
    let code = tokens.next().ok_or_else(|| {
        ClientError::ProtocolParse(format!("Status line has no status code: {}", line.trim()))
    })?;
    if code.len() != 3 {
        return Err(ClientError::ProtocolParse(format!(
            "Invalid status code: {}",
            code
        )));
    }
    let code: u16 = code
        .parse()
        .map_err(|_| ClientError::ProtocolParse(format!("Invalid status code: {}", code)))?;

    Ok(StatusLine {
        version: version.to_string(),
        code,
        reason: tokens.collect::<Vec<_>>().join(" "),
    })
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// `application/json` and `+json` bodies
    Json(serde_json::Value),
    /// Flat `key=value&...` bodies, in order of first appearance
    Form(Vec<(String, String)>),
    /// Any other media type, bytes as received after content decoding
    Raw(Vec<u8>),
}

impl Entity {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Entity::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&[(String, String)]> {
        match self {
            Entity::Form(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Entity::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Look up a key of a form entity.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.as_form()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::Raw(Vec::new())
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status_code: u16,
    reason_phrase: String,
    http_version: String,
    headers: HeaderMap,
    raw_body: Vec<u8>,
    content_type: Option<String>,
    charset: String,
    entity: Entity,
}

impl Default for Response {
    /// An unparsed response: status code 0.
    fn default() -> Self {
        Self {
            status_code: 0,
            reason_phrase: String::new(),
            http_version: String::new(),
            headers: HeaderMap::new(),
            raw_body: Vec::new(),
            content_type: None,
            charset: DEFAULT_CHARSET.to_string(),
            entity: Entity::default(),
        }
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn http_version(&self) -> &str {
        &self.http_version
    }

    /// Whether the status code is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// All headers, keyed by lowercase name.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive header lookup; `None` when absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name.trim())
    }

    /// Body after transfer and content decoding.
    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    /// Media type from `Content-Type`, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn into_entity(self) -> Entity {
        self.entity
    }

    /// Body decoded as text using the response charset.
    pub fn text(&self) -> String {
        match self.charset.to_ascii_lowercase().as_str() {
            "iso-8859-1" | "iso8859-1" | "latin1" | "us-ascii" | "ascii" => {
                self.raw_body.iter().map(|&b| char::from(b)).collect()
            }
            _ => String::from_utf8_lossy(&self.raw_body).into_owned(),
        }
    }

    /// Deserialize the body as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.raw_body)
            .map_err(|e| ClientError::ProtocolParse(format!("Invalid JSON body: {}", e)))
    }
}

/// Reads and decodes one response from a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser {
    expect_body: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self { expect_body: true }
    }

    /// Parser for the reply to `method`. Replies to HEAD carry no body.
    pub fn for_method(method: Method) -> Self {
        Self {
            expect_body: method != Method::Head,
        }
    }

    /// Parse a response, reading until the body is complete.
    ///
    /// Fails with `ProtocolParse` when no status line arrives before the
    /// stream ends. Anything read before a failure is discarded.
    pub fn parse<R: Read>(&self, reader: R) -> Result<Response> {
        let mut reader = BufReader::new(reader);
        let mut response = Response::default();

        let status = read_status_line(&mut reader)?;
        response.status_code = status.code;
        response.reason_phrase = status.reason;
        response.http_version = status.version;

        response.headers = read_headers(&mut reader)?;

        let body = if self.expect_body && status_allows_body(response.status_code) {
            read_body(&mut reader, &response.headers)?
        } else {
            Vec::new()
        };
        response.raw_body = decode_content(body, response.headers.get("content-encoding"))?;

        if let Some(value) = response.headers.get("content-type") {
            let (media_type, charset) = parse_content_type(value);
            response.content_type = Some(media_type);
            if let Some(charset) = charset {
                response.charset = charset;
            }
        }
        response.entity = decode_entity(response.content_type.as_deref(), &response.raw_body);

        Ok(response)
    }
}

fn status_allows_body(code: u16) -> bool {
    !(100..200).contains(&code) && code != 204 && code != 304
}

/// Read one line including its terminator. A TLS peer that closes without
/// `close_notify` reads as end of stream.
fn read_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> Result<usize> {
    match reader.read_until(b'\n', line) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(e) => Err(ClientError::io("Failed to read response", e)),
    }
}

fn read_status_line<R: BufRead>(reader: &mut R) -> Result<StatusLine> {
    loop {
        let mut line = Vec::new();
        if read_line(reader, &mut line)? == 0 {
            return Err(ClientError::ProtocolParse(
                "Connection closed before a status line was received".to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&line);
        if !text.trim().is_empty() {
            return parse_status_line(&text);
        }
    }
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut last_header: Option<String> = None;
    let mut consumed = 0usize;

    loop {
        let mut line = Vec::new();
        let limit = (MAX_HEADER_BYTES - consumed + 1) as u64;
        let n = read_line(&mut reader.by_ref().take(limit), &mut line)?;
        if n == 0 {
            break;
        }
        consumed += n;
        if consumed > MAX_HEADER_BYTES {
            return Err(ClientError::ProtocolParse(format!(
                "Response header block exceeds {} bytes",
                MAX_HEADER_BYTES
            )));
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
        let text = String::from_utf8_lossy(&line);

        // obs-fold: continuation of the previous header's value
        if text.starts_with(|c| c == ' ' || c == '\t') {
            if let Some(value) = last_header.as_deref().and_then(|name| headers.get_mut(name)) {
                let folded = text.trim();
                if !folded.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(folded);
                }
                continue;
            }
        }

        match text.split_once(':') {
            Some((name, value)) => {
                let name = name.trim().to_ascii_lowercase();
                headers.append(name.clone(), value.trim());
                last_header = Some(name);
            }
            None => log::warn!("skipping malformed header line: {:?}", text.trim_end()),
        }
    }

    Ok(headers)
}

fn read_body<R: BufRead>(reader: &mut R, headers: &HeaderMap) -> Result<Vec<u8>> {
    let chunked = headers
        .get("transfer-encoding")
        .and_then(|te| te.rsplit(',').next())
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return read_chunked(reader);
    }

    if let Some(length) = headers.get("content-length") {
        let length: u64 = length.trim().parse().map_err(|_| {
            ClientError::ProtocolParse(format!("Invalid Content-Length: {}", length))
        })?;
        let body = read_to_end(&mut reader.take(length))?;
        if (body.len() as u64) < length {
            return Err(ClientError::ProtocolParse(format!(
                "Body ended after {} of {} bytes",
                body.len(),
                length
            )));
        }
        return Ok(body);
    }

    read_to_end(reader)
}

fn read_to_end<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(body),
            Ok(n) => body.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(body),
            Err(e) => return Err(ClientError::io("Failed to read response body", e)),
        }
    }
}

/// Collect a chunked body into one buffer. Trailers are read and dropped.
///
/// Chunk sizes come from the peer, so each chunk is read through a limit
/// and the buffer only grows by what actually arrives.
fn read_chunked<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut line = Vec::new();
        if read_line(reader, &mut line)? == 0 {
            return Err(ClientError::ProtocolParse(
                "Chunked body ended without a last chunk".to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&line);
        let size_field = text.split(';').next().unwrap_or("").trim();
        if size_field.is_empty() {
            continue;
        }
        let size = u64::from_str_radix(size_field, 16).map_err(|_| {
            ClientError::ProtocolParse(format!("Invalid chunk size: {}", size_field))
        })?;

        if size == 0 {
            loop {
                let mut trailer = Vec::new();
                if read_line(reader, &mut trailer)? == 0
                    || trailer == b"\r\n"
                    || trailer == b"\n"
                {
                    return Ok(body);
                }
            }
        }

        if (body.len() as u64).checked_add(size).is_none() {
            return Err(ClientError::ProtocolParse(format!(
                "Chunk size too large: {}",
                size_field
            )));
        }
        let chunk = read_to_end(&mut reader.by_ref().take(size))?;
        if (chunk.len() as u64) < size {
            return Err(ClientError::ProtocolParse(
                "Chunked body truncated".to_string(),
            ));
        }
        body.extend_from_slice(&chunk);
    }
}

/// Reverse `Content-Encoding`. Unknown codings pass through unchanged.
fn decode_content(body: Vec<u8>, encoding: Option<&str>) -> Result<Vec<u8>> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    if body.is_empty() {
        return Ok(body);
    }

    match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            MultiGzDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .map_err(|e| ClientError::ProtocolParse(format!("Invalid gzip body: {}", e)))?;
            Ok(decoded)
        }
        Some("deflate") => {
            // Servers send both zlib-wrapped and raw deflate under this name.
            let mut decoded = Vec::new();
            if ZlibDecoder::new(&body[..]).read_to_end(&mut decoded).is_ok() {
                return Ok(decoded);
            }
            decoded.clear();
            DeflateDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .map_err(|e| {
                    ClientError::ProtocolParse(format!("Invalid deflate body: {}", e))
                })?;
            Ok(decoded)
        }
        Some("") | Some("identity") | None => Ok(body),
        Some(other) => {
            log::debug!("leaving body with content-encoding {} undecoded", other);
            Ok(body)
        }
    }
}

/// Split a `Content-Type` value into media type and optional charset.
pub(crate) fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_string();
    let charset = parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty());
    (media_type, charset)
}

fn decode_entity(media_type: Option<&str>, body: &[u8]) -> Entity {
    let media_type = media_type.map(|m| m.to_ascii_lowercase()).unwrap_or_default();
    match media_type.as_str() {
        "application/json" => decode_json(body),
        m if m.ends_with("+json") => decode_json(body),
        // XML bodies are read as flat key=value pairs, not as a tree.
        "text/xml" | "application/xml" | "application/x-www-form-urlencoded" => {
            Entity::Form(decode_form(body))
        }
        _ => Entity::Raw(body.to_vec()),
    }
}

fn decode_json(body: &[u8]) -> Entity {
    match serde_json::from_slice(body) {
        Ok(value) => Entity::Json(value),
        Err(e) => {
            log::warn!("response declared JSON but did not parse: {}", e);
            Entity::Raw(body.to_vec())
        }
    }
}

fn decode_form(body: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(body);
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(text.trim().as_bytes()) {
        let existing = pairs.iter().position(|(k, _)| *k == key);
        match existing {
            Some(idx) => pairs[idx].1 = value.into_owned(),
            None => pairs.push((key.into_owned(), value.into_owned())),
        }
    }
    pairs
}
