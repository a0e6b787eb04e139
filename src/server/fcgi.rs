//! FastCGI responder for Unix-socket binds.
//!
//! Records are read by a separate task, so a web server can interleave
//! several requests on one connection; requests are executed one at a time
//! in the order their input completes. The connection is Active from the
//! first BEGIN_REQUEST until no request is pending, then Idle.

use super::body::{self, Body, BoxError};
use super::gate::DispatchGate;
use crate::conn::{ConnState, ConnTracker, Connection, Transition};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, Version};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

const VERSION_1: u8 = 1;
const HEADER_LEN: usize = 8;
const MAX_CONTENT: usize = u16::MAX as usize;

const BEGIN_REQUEST: u8 = 1;
const ABORT_REQUEST: u8 = 2;
const END_REQUEST: u8 = 3;
const PARAMS: u8 = 4;
const STDIN: u8 = 5;
const STDOUT: u8 = 6;
const DATA: u8 = 8;
const GET_VALUES: u8 = 9;
const GET_VALUES_RESULT: u8 = 10;
const UNKNOWN_TYPE: u8 = 11;

const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 1;

const REQUEST_COMPLETE: u8 = 0;
const OVERLOADED: u8 = 2;
const UNKNOWN_ROLE: u8 = 3;

/// Per-connection bounds on what the responder buffers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Request ids pending at once. Advertised as `FCGI_MAX_REQS`.
    pub max_requests: usize,
    pub max_params: usize,
    pub max_stdin: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_requests: 16,
            max_params: 64 * 1024,
            max_stdin: 8 * 1024 * 1024,
        }
    }
}

/// CGI parameters the web server sent with a request, available to
/// handlers through the request extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastCgiParams(pub HashMap<String, String>);

impl FastCgiParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub kind: u8,
    pub request_id: u16,
    pub content: Bytes,
}

/// Read one record. `None` on a clean end of stream.
pub(crate) async fn read_record<R>(reader: &mut R) -> io::Result<Option<Record>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if header[0] != VERSION_1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported FastCGI version {}", header[0]),
        ));
    }

    let kind = header[1];
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding = header[6] as usize;

    let mut content = vec![0u8; content_len + padding];
    reader.read_exact(&mut content).await?;
    content.truncate(content_len);

    Ok(Some(Record {
        kind,
        request_id,
        content: Bytes::from(content),
    }))
}

/// Append one record to `buf`. `content` must fit in a single record.
pub(crate) fn encode_record(buf: &mut Vec<u8>, kind: u8, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT);
    let padding = content.len().wrapping_neg() & 7;
    buf.push(VERSION_1);
    buf.push(kind);
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.resize(buf.len() + padding, 0);
}

fn read_length(buf: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *buf.get(*pos)?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Some(first as usize);
    }
    let bytes: [u8; 4] = buf.get(*pos..*pos + 4)?.try_into().ok()?;
    *pos += 4;
    Some((u32::from_be_bytes(bytes) & 0x7fff_ffff) as usize)
}

/// Decode name-value pairs. Decoding stops at the first malformed pair.
pub(crate) fn decode_pairs(buf: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let Some(name_len) = read_length(buf, &mut pos) else {
            break;
        };
        let Some(value_len) = read_length(buf, &mut pos) else {
            break;
        };
        let Some(name) = buf.get(pos..pos + name_len) else {
            break;
        };
        let Some(value) = buf.get(pos + name_len..pos + name_len + value_len) else {
            break;
        };
        pos += name_len + value_len;
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    pairs
}

fn write_length(buf: &mut Vec<u8>, len: usize) {
    if len <= 127 {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&(len as u32 | 0x8000_0000).to_be_bytes());
    }
}

pub(crate) fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in pairs {
        write_length(&mut buf, name.len());
        write_length(&mut buf, value.len());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

/// Build the request a handler sees from CGI parameters and stdin.
pub(crate) fn build_request(
    params: HashMap<String, String>,
    stdin: Bytes,
) -> Result<Request<Body>, BoxError> {
    let param = |name: &str| params.get(name).map(String::as_str).filter(|v| !v.is_empty());

    let method = param("REQUEST_METHOD").unwrap_or("GET");
    let uri = match param("REQUEST_URI") {
        Some(uri) => uri.to_string(),
        None => {
            let mut uri = format!(
                "{}{}",
                param("SCRIPT_NAME").unwrap_or(""),
                param("PATH_INFO").unwrap_or("")
            );
            if uri.is_empty() {
                uri.push('/');
            }
            if let Some(query) = param("QUERY_STRING") {
                uri.push('?');
                uri.push_str(query);
            }
            uri
        }
    };
    let version = match param("SERVER_PROTOCOL") {
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder().method(method).uri(uri).version(version);
    for (name, value) in &params {
        let header = match name.strip_prefix("HTTP_") {
            Some(rest) => rest,
            None if name == "CONTENT_TYPE" || name == "CONTENT_LENGTH" => name.as_str(),
            None => continue,
        };
        if value.is_empty() && !name.starts_with("HTTP_") {
            continue;
        }
        builder = builder.header(header.replace('_', "-").to_ascii_lowercase(), value.as_str());
    }

    builder
        .extension(FastCgiParams(params))
        .body(body::full(stdin))
        .map_err(Into::into)
}

#[derive(Debug, Default)]
struct PendingRequest {
    keep_conn: bool,
    params: Vec<u8>,
    params_done: bool,
    stdin: Vec<u8>,
    stdin_done: bool,
}

impl PendingRequest {
    fn is_ready(&self) -> bool {
        self.params_done && self.stdin_done
    }
}

enum Flow {
    Continue,
    Close,
}

struct Responder<W> {
    writer: BufWriter<W>,
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
    gate: DispatchGate,
    requests: HashMap<u16, PendingRequest>,
    limits: Limits,
    active: bool,
    close_when_idle: bool,
}

impl<W: AsyncWrite + Unpin> Responder<W> {
    async fn on_record(&mut self, record: Record) -> io::Result<Flow> {
        trace!(
            conn = self.conn.id(),
            kind = record.kind,
            request_id = record.request_id,
            len = record.content.len(),
            "fastcgi record"
        );

        match record.kind {
            BEGIN_REQUEST => self.begin(record).await,
            ABORT_REQUEST => {
                let Some(request) = self.requests.remove(&record.request_id) else {
                    return Ok(Flow::Continue);
                };
                debug!(conn = self.conn.id(), request_id = record.request_id, "request aborted");
                self.end_request(record.request_id, REQUEST_COMPLETE).await?;
                self.finish(request.keep_conn).await
            }
            PARAMS | STDIN => {
                let Some(request) = self.requests.get_mut(&record.request_id) else {
                    return Ok(Flow::Continue);
                };
                let (buf, done, limit, rejection) = if record.kind == PARAMS {
                    (
                        &mut request.params,
                        &mut request.params_done,
                        self.limits.max_params,
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    )
                } else {
                    (
                        &mut request.stdin,
                        &mut request.stdin_done,
                        self.limits.max_stdin,
                        StatusCode::PAYLOAD_TOO_LARGE,
                    )
                };
                if record.content.is_empty() {
                    *done = true;
                } else if buf.len() + record.content.len() > limit {
                    return self.reject(record.request_id, rejection).await;
                } else {
                    buf.extend_from_slice(&record.content);
                }
                if request.is_ready() {
                    return self.execute(record.request_id).await;
                }
                Ok(Flow::Continue)
            }
            DATA => Ok(Flow::Continue),
            GET_VALUES => {
                let max_requests = self.limits.max_requests.to_string();
                let known = [
                    ("FCGI_MPXS_CONNS", "1"),
                    ("FCGI_MAX_REQS", max_requests.as_str()),
                ];
                let requested = decode_pairs(&record.content);
                let reply = encode_pairs(
                    known
                        .into_iter()
                        .filter(|(name, _)| requested.iter().any(|(n, _)| n == name)),
                );
                self.write_record(GET_VALUES_RESULT, 0, &reply).await?;
                self.writer.flush().await?;
                Ok(Flow::Continue)
            }
            other => {
                debug!(conn = self.conn.id(), kind = other, "unknown FastCGI record type");
                self.write_record(UNKNOWN_TYPE, 0, &[other, 0, 0, 0, 0, 0, 0, 0])
                    .await?;
                self.writer.flush().await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn begin(&mut self, record: Record) -> io::Result<Flow> {
        if record.content.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short BEGIN_REQUEST body",
            ));
        }
        if self.requests.contains_key(&record.request_id) {
            debug!(conn = self.conn.id(), request_id = record.request_id, "duplicate request id, ignoring");
            return Ok(Flow::Continue);
        }

        let role = u16::from_be_bytes([record.content[0], record.content[1]]);
        let keep_conn = record.content[2] & FLAG_KEEP_CONN != 0;
        if role != ROLE_RESPONDER {
            debug!(conn = self.conn.id(), role, "unsupported FastCGI role");
            self.end_request(record.request_id, UNKNOWN_ROLE).await?;
            self.writer.flush().await?;
            return Ok(if keep_conn { Flow::Continue } else { Flow::Close });
        }

        if self.requests.len() >= self.limits.max_requests {
            debug!(conn = self.conn.id(), request_id = record.request_id, "too many pending requests");
            self.end_request(record.request_id, OVERLOADED).await?;
            self.writer.flush().await?;
            return Ok(Flow::Continue);
        }

        if !self.active {
            if self.tracker.on_state_change(&self.conn, ConnState::Active) == Transition::ForceClose {
                return Ok(Flow::Close);
            }
            self.active = true;
        }

        self.requests.insert(
            record.request_id,
            PendingRequest {
                keep_conn,
                ..Default::default()
            },
        );
        Ok(Flow::Continue)
    }

    async fn execute(&mut self, request_id: u16) -> io::Result<Flow> {
        let Some(pending) = self.requests.remove(&request_id) else {
            return Ok(Flow::Continue);
        };
        let params: HashMap<String, String> = decode_pairs(&pending.params).into_iter().collect();

        let response = match build_request(params, Bytes::from(pending.stdin)) {
            Ok(request) => self.gate.dispatch(request).await,
            Err(e) => {
                debug!(conn = self.conn.id(), request_id, error = %e, "invalid FastCGI request");
                let mut response = Response::new(body::empty());
                *response.status_mut() = StatusCode::BAD_REQUEST;
                response
            }
        };

        self.write_response(request_id, response).await?;
        self.end_request(request_id, REQUEST_COMPLETE).await?;
        self.finish(pending.keep_conn).await
    }

    /// Drop a request whose input outgrew its limit and answer it with
    /// `status` instead of calling the handler.
    async fn reject(&mut self, request_id: u16, status: StatusCode) -> io::Result<Flow> {
        let Some(pending) = self.requests.remove(&request_id) else {
            return Ok(Flow::Continue);
        };
        debug!(conn = self.conn.id(), request_id, %status, "FastCGI request too large");

        let mut response = Response::new(body::empty());
        *response.status_mut() = status;
        self.write_response(request_id, response).await?;
        self.end_request(request_id, REQUEST_COMPLETE).await?;
        self.finish(pending.keep_conn).await
    }

    async fn write_response(&mut self, request_id: u16, response: Response<Body>) -> io::Result<()> {
        let (parts, mut body) = response.into_parts();

        let mut head = format!(
            "Status: {} {}\r\n",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        );
        for (name, value) in &parts.headers {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(&String::from_utf8_lossy(value.as_bytes()));
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.write_stream(STDOUT, request_id, head.as_bytes()).await?;

        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        self.write_stream(STDOUT, request_id, &data).await?;
                    }
                }
                Err(e) => {
                    warn!(conn = self.conn.id(), request_id, error = %e, "response body failed");
                    break;
                }
            }
        }
        self.write_record(STDOUT, request_id, &[]).await
    }

    async fn end_request(&mut self, request_id: u16, protocol_status: u8) -> io::Result<()> {
        let mut content = [0u8; 8];
        content[4] = protocol_status;
        self.write_record(END_REQUEST, request_id, &content).await
    }

    /// Flush, and go Idle when nothing is pending.
    async fn finish(&mut self, keep_conn: bool) -> io::Result<Flow> {
        self.writer.flush().await?;
        if self.requests.is_empty() && self.active {
            self.active = false;
            self.tracker.on_state_change(&self.conn, ConnState::Idle);
        }
        if !keep_conn || (self.close_when_idle && self.requests.is_empty()) {
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn write_stream(&mut self, kind: u8, request_id: u16, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(MAX_CONTENT) {
            self.write_record(kind, request_id, chunk).await?;
        }
        Ok(())
    }

    async fn write_record(&mut self, kind: u8, request_id: u16, content: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN + content.len() + 7);
        encode_record(&mut buf, kind, request_id, content);
        self.writer.write_all(&buf).await
    }
}

/// Serve FastCGI on `stream` until the web server closes it, no request
/// asks to keep it, keep-alive or the gate closes while idle, or the tracker
/// force-closes the connection.
pub(crate) async fn serve_connection<S>(
    stream: S,
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
    gate: DispatchGate,
    keep_alives: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    serve_with_limits(stream, conn, tracker, gate, keep_alives, Limits::default()).await
}

async fn serve_with_limits<S>(
    stream: S,
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
    gate: DispatchGate,
    mut keep_alives: watch::Receiver<bool>,
    limits: Limits,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (records_tx, mut records) = mpsc::channel::<io::Result<Record>>(16);
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            match read_record(&mut reader).await {
                Ok(Some(record)) => {
                    if records_tx.send(Ok(record)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = records_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let keep_alive = *keep_alives.borrow_and_update();
    let mut watching = keep_alive;
    let drain = gate.clone();
    let mut draining = false;
    let mut responder: Responder<WriteHalf<S>> = Responder {
        writer: BufWriter::new(write_half),
        conn: Arc::clone(&conn),
        tracker,
        gate,
        requests: HashMap::new(),
        limits,
        active: false,
        close_when_idle: !keep_alive,
    };

    loop {
        let record = tokio::select! {
            record = records.recv() => record,
            _ = conn.close_requested() => {
                debug!(conn = conn.id(), "dropping connection");
                break;
            }
            changed = keep_alives.changed(), if watching => {
                if changed.is_err() || !*keep_alives.borrow_and_update() {
                    watching = false;
                    responder.close_when_idle = true;
                    if responder.requests.is_empty() {
                        debug!(conn = conn.id(), "keep-alive disabled, closing idle connection");
                        break;
                    }
                }
                continue;
            }
            _ = drain.closed(), if !draining => {
                draining = true;
                responder.close_when_idle = true;
                if responder.requests.is_empty() {
                    debug!(conn = conn.id(), "draining, closing idle connection");
                    break;
                }
                continue;
            }
        };

        let record = match record {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                warn!(conn = conn.id(), error = %e, "failed to read FastCGI record");
                break;
            }
            None => break,
        };

        match responder.on_record(record).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "FastCGI connection failed");
                break;
            }
        }
    }

    reader.abort();
    if !conn.is_close_requested() {
        let _ = responder.writer.shutdown().await;
    }
}
