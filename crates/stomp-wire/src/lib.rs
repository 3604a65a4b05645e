// stomp-wire: STOMP 1.0/1.1 frame model and wire codec.
//
// Framing is the standard STOMP shape: a command line, `key:value` header
// lines until a blank line, then a body terminated by NUL (or sized by a
// `content-length` header when the body itself contains NULs).  A bare
// newline between frames is a heart-beat keep-alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on the command + header block of a single frame.
///
/// Bodies are sized separately (by `content-length` or the NUL scan); a
/// header block that grows past this without a terminating blank line is a
/// protocol error, not a reason to keep buffering.
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// How many pooled read buffers a [`BufferPool`] retains.
const POOL_RETAIN: usize = 64;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// The STOMP commands this broker recognizes.
///
/// Unknown commands parse as `Other` so the connection layer can reject them
/// with a proper ERROR frame instead of a framing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
    Other(String),
}

impl Command {
    fn from_line(line: &str) -> Command {
        match line {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => Command::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Other(s) => s,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A decoded STOMP frame.
///
/// Headers keep their wire order; repeated headers are retained and the
/// first occurrence wins on lookup, per the STOMP spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Frame {
        Frame {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Frame {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Frame {
        self.body = body.into();
        self
    }

    /// First occurrence of `name`, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first occurrence of `name`, or append if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.headers.iter_mut().find(|(k, _)| k == name) {
            entry.1 = value.to_owned();
        } else {
            self.headers.push((name.to_owned(), value.to_owned()));
        }
    }

    // -----------------------------------------------------------------------
    // Server frame constructors
    // -----------------------------------------------------------------------

    pub fn connected(version: &str, session: &str, heart_beat: &str) -> Frame {
        Frame::new(Command::Connected)
            .with_header("version", version)
            .with_header("session", session)
            .with_header("heart-beat", heart_beat)
    }

    pub fn receipt(receipt_id: &str) -> Frame {
        Frame::new(Command::Receipt).with_header("receipt-id", receipt_id)
    }

    pub fn error(message: &str) -> Frame {
        Frame::new(Command::Error).with_header("message", message)
    }
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("frame header block exceeds {0} bytes")]
    HeaderBlockTooLarge(usize),
    #[error("frame contains invalid UTF-8")]
    Utf8,
}

/// One unit produced by the decoder: a full frame, or a bare newline
/// keep-alive between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Frame(Frame),
    KeepAlive,
}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

/// Protocol identification predicate: a STOMP connection opens with a
/// CONNECT or STOMP frame.
pub fn identify(buf: &[u8]) -> bool {
    buf.starts_with(b"CONNECT") || buf.starts_with(b"STOMP")
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Incremental frame decoder.
///
/// `decode` consumes at most one wire event from the front of the buffer
/// and returns `None` when more bytes are needed.
#[derive(Debug)]
pub struct FrameDecoder {
    max_header_block: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder {
            max_header_block: MAX_HEADER_BLOCK,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<WireEvent>, WireError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Bare EOL between frames is a keep-alive.
        if buf[0] == b'\n' {
            let _ = buf.split_to(1);
            return Ok(Some(WireEvent::KeepAlive));
        }
        if buf[0] == b'\r' {
            if buf.len() < 2 {
                return Ok(None);
            }
            if buf[1] == b'\n' {
                let _ = buf.split_to(2);
                return Ok(Some(WireEvent::KeepAlive));
            }
            return Err(WireError::Malformed("bare carriage return"));
        }

        let Some(header_end) = find_header_end(buf) else {
            if buf.len() > self.max_header_block {
                return Err(WireError::HeaderBlockTooLarge(self.max_header_block));
            }
            return Ok(None);
        };
        if header_end > self.max_header_block {
            return Err(WireError::HeaderBlockTooLarge(self.max_header_block));
        }

        let block = std::str::from_utf8(&buf[..header_end]).map_err(|_| WireError::Utf8)?;
        let mut lines = block.split('\n').map(strip_cr);

        let command_line = lines.next().unwrap_or("");
        if command_line.is_empty() {
            return Err(WireError::Malformed("empty command line"));
        }
        let command = Command::from_line(command_line);

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(WireError::Malformed("header line without ':'"));
            };
            headers.push((unescape(key)?, unescape(value)?));
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.parse::<usize>()
                    .map_err(|_| WireError::Malformed("invalid content-length"))
            })
            .transpose()?;

        // Locate the end of the body and the trailing NUL.
        let body_range = match content_length {
            Some(len) => {
                if buf.len() < header_end + len + 1 {
                    return Ok(None);
                }
                if buf[header_end + len] != 0 {
                    return Err(WireError::Malformed("missing NUL after sized body"));
                }
                header_end..header_end + len
            }
            None => match buf[header_end..].iter().position(|&b| b == 0) {
                Some(rel) => header_end..header_end + rel,
                None => return Ok(None),
            },
        };

        let total = body_range.end + 1;
        let body = Bytes::copy_from_slice(&buf[body_range]);
        let _ = buf.split_to(total);

        Ok(Some(WireEvent::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

/// Index just past the blank line that terminates the header block.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some(i + 2);
            }
            if buf[i + 1] == b'\r' && i + 2 < buf.len() && buf[i + 2] == b'\n' {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// STOMP 1.1 header unescaping.  1.0 peers never produce escapes, so
/// applying this unconditionally is safe.
fn unescape(s: &str) -> Result<String, WireError> {
    if !s.contains('\\') {
        return Ok(s.to_owned());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(WireError::Malformed("invalid header escape")),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Serialize `frame` onto `buf`.
///
/// A `content-length` header is added for non-empty bodies unless the frame
/// already carries one (MESSAGE frames echo the original SEND headers).
pub fn encode(frame: &Frame, buf: &mut BytesMut) {
    let estimate = frame.command.as_str().len()
        + frame
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum::<usize>()
        + frame.body.len()
        + 32;
    buf.reserve(estimate);

    buf.put_slice(frame.command.as_str().as_bytes());
    buf.put_u8(b'\n');
    for (key, value) in &frame.headers {
        put_escaped(key, buf);
        buf.put_u8(b':');
        put_escaped(value, buf);
        buf.put_u8(b'\n');
    }
    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        buf.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    }
    buf.put_u8(b'\n');
    buf.put_slice(&frame.body);
    buf.put_u8(0);
}

/// A keep-alive is a single newline.
pub fn encode_keep_alive(buf: &mut BytesMut) {
    buf.put_u8(b'\n');
}

fn put_escaped(s: &str, buf: &mut BytesMut) {
    for &b in s.as_bytes() {
        match b {
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            b':' => buf.put_slice(b"\\c"),
            b'\\' => buf.put_slice(b"\\\\"),
            b => buf.put_u8(b),
        }
    }
}

// ---------------------------------------------------------------------------
// IO counters
// ---------------------------------------------------------------------------

/// Shared read/write byte counters, bumped by the connection's reader and
/// writer and sampled by the heart-beat monitor.
#[derive(Debug, Clone, Default)]
pub struct IoCounters {
    inner: Arc<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    read: AtomicU64,
    written: AtomicU64,
}

impl IoCounters {
    pub fn new() -> IoCounters {
        IoCounters::default()
    }

    pub fn record_read(&self, n: usize) {
        self.inner.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, n: usize) {
        self.inner.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.written.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Buffer pool
// ---------------------------------------------------------------------------

/// Pool of reusable read buffers.
///
/// A virtual host may attach one so connections reading large bodies stop
/// churning fresh allocations; `give` recycles a buffer on teardown.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    pool: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> BufferPool {
        BufferPool {
            buffer_size,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> BytesMut {
        let pooled = self.pool.lock().ok().and_then(|mut p| p.pop());
        pooled.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    pub fn give(&self, mut buf: BytesMut) {
        buf.clear();
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < POOL_RETAIN {
                pool.push(buf);
            }
        }
    }
}
