//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! This module reads the first handshake message of a TLS connection and
//! recovers the SNI hostname for routing decisions, keeping every byte it
//! consumed so the caller can replay them to the backend verbatim.
//!
//! Reading is bounded twice:
//! - sniff timeout: 5s default
//! - max sniff bytes: 16 KiB default
//!
//! The ClientHello may be fragmented across several TLS records; records are
//! reassembled until the full handshake message is available or the byte
//! budget runs out.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::trace;

use crate::error::ConnectionError;

/// Default timeout for SNI sniffing.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum bytes buffered while sniffing (16 KiB).
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 16 * 1024;

/// TLS record header: type (1), version (2), length (2).
pub const RECORD_HEADER_LEN: usize = 5;

/// Handshake header: type (1), length (3).
const HANDSHAKE_HEADER_LEN: usize = 4;

/// Record content type for handshake records.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Configuration for SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniConfig {
    /// Maximum time to wait for the complete ClientHello.
    pub timeout: Duration,
    /// Maximum bytes to buffer, record headers included.
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// SNI inspector for TLS ClientHello parsing.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    /// Create a new SNI inspector with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new SNI inspector with custom configuration.
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Inspect a stream for SNI, reading into the provided sniff buffer.
    ///
    /// On success returns the hostname, or `None` when the ClientHello has no
    /// server_name extension. Every byte read from `stream` is appended to
    /// `buffer` exactly once, and nothing past the end of the ClientHello is
    /// read. The caller must forward the buffer to the backend.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> Result<Option<String>, ConnectionError> {
        buffer.clear();

        let message = match timeout(self.config.timeout, self.read_client_hello(stream, buffer))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::SniffTimeout(self.config.timeout)),
        };

        let hello = ClientHelloView::parse(&message)?;
        let hostname = hello.server_name()?.map(str::to_owned);

        trace!(
            sniffed_bytes = buffer.len(),
            handshake_len = hello.handshake_len(),
            client_version = hello.client_version(),
            cipher_suites = hello.cipher_suite_count(),
            hostname = ?hostname,
            "ClientHello parsed"
        );

        Ok(hostname)
    }

    /// Read records until one complete ClientHello handshake message is
    /// reassembled. Returns the reassembled message; raw record bytes go to
    /// `buffer`.
    async fn read_client_hello<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> Result<Vec<u8>, ConnectionError> {
        let mut message = Vec::new();

        loop {
            let header_start = self.read_exact_into(stream, buffer, RECORD_HEADER_LEN).await?;
            let header = &buffer[header_start..header_start + RECORD_HEADER_LEN];

            if header[0] != RECORD_TYPE_HANDSHAKE {
                if message.is_empty() {
                    return Err(ConnectionError::NotHandshake(format!(
                        "record type {:#04x}",
                        header[0]
                    )));
                }
                return Err(ConnectionError::MalformedClientHello(
                    "non-handshake record inside ClientHello",
                ));
            }

            let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
            if record_len == 0 {
                return Err(ConnectionError::MalformedClientHello(
                    "empty handshake record",
                ));
            }

            let payload_start = self.read_exact_into(stream, buffer, record_len).await?;
            message.extend_from_slice(&buffer[payload_start..]);

            if message.len() < HANDSHAKE_HEADER_LEN {
                continue;
            }

            if message[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
                return Err(ConnectionError::NotHandshake(format!(
                    "handshake type {:#04x}",
                    message[0]
                )));
            }

            let handshake_len = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
            let needed = HANDSHAKE_HEADER_LEN + handshake_len;
            if message.len() >= needed {
                // Anything after the ClientHello in the same record stays in
                // the sniff buffer and is replayed, it just isn't parsed.
                message.truncate(needed);
                return Ok(message);
            }

            // At least one more record header plus the missing payload.
            let outstanding = RECORD_HEADER_LEN + (needed - message.len());
            if buffer.len() + outstanding > self.config.max_bytes {
                return Err(ConnectionError::HandshakeTooLarge {
                    limit: self.config.max_bytes,
                });
            }
        }
    }

    /// Append exactly `n` bytes from `stream` to `buffer`, refusing to grow
    /// past the byte budget. Returns the offset the new bytes start at.
    async fn read_exact_into<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
        n: usize,
    ) -> Result<usize, ConnectionError> {
        let start = buffer.len();
        let end = start + n;
        if end > self.config.max_bytes {
            return Err(ConnectionError::HandshakeTooLarge {
                limit: self.config.max_bytes,
            });
        }

        buffer.reserve_exact(n);
        while buffer.len() < end {
            let want = (end - buffer.len()) as u64;
            let read = (&mut *stream).take(want).read_buf(buffer).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed during ClientHello",
                )
                .into());
            }
        }

        Ok(start)
    }
}

/// Read-only view over a reassembled ClientHello handshake message.
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - 2 bytes: client version
/// - 32 bytes: random
/// - 1 byte + variable: session ID
/// - 2 bytes + variable: cipher suites
/// - 1 byte + variable: compression methods
/// - 2 bytes + variable: extensions (optional)
#[derive(Debug, Clone, Copy)]
pub struct ClientHelloView<'a> {
    handshake_len: usize,
    client_version: u16,
    cipher_suites: &'a [u8],
    extensions: Option<&'a [u8]>,
}

impl<'a> ClientHelloView<'a> {
    /// Parse a complete handshake message (header included).
    pub fn parse(message: &'a [u8]) -> Result<Self, ConnectionError> {
        let mut reader = Reader::new(message);

        let msg_type = reader.u8("truncated handshake header")?;
        if msg_type != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(ConnectionError::NotHandshake(format!(
                "handshake type {:#04x}",
                msg_type
            )));
        }

        let handshake_len = reader.u24("truncated handshake header")?;
        let mut body = Reader::new(reader.take(handshake_len, "handshake length exceeds message")?);

        let client_version = body.u16("truncated client version")?;
        body.take(32, "truncated random")?;

        let session_id_len = body.u8("truncated session id")? as usize;
        body.take(session_id_len, "session id length exceeds message")?;

        let cipher_suites_len = body.u16("truncated cipher suites")? as usize;
        let cipher_suites = body.take(cipher_suites_len, "cipher suites length exceeds message")?;

        let compression_len = body.u8("truncated compression methods")? as usize;
        body.take(compression_len, "compression methods length exceeds message")?;

        let extensions = if body.is_empty() {
            None
        } else {
            let extensions_len = body.u16("truncated extensions length")? as usize;
            Some(body.take(extensions_len, "extensions length exceeds message")?)
        };

        Ok(Self {
            handshake_len,
            client_version,
            cipher_suites,
            extensions,
        })
    }

    /// Declared handshake body length.
    pub fn handshake_len(&self) -> usize {
        self.handshake_len
    }

    /// Legacy client version field.
    pub fn client_version(&self) -> u16 {
        self.client_version
    }

    /// Number of offered cipher suites.
    pub fn cipher_suite_count(&self) -> usize {
        self.cipher_suites.len() / 2
    }

    /// Find the server_name extension and return its host_name value.
    ///
    /// Scanning stops at the first server_name extension.
    pub fn server_name(&self) -> Result<Option<&'a str>, ConnectionError> {
        let Some(extensions) = self.extensions else {
            return Ok(None);
        };

        let mut reader = Reader::new(extensions);
        while !reader.is_empty() {
            let ext_type = reader.u16("truncated extension header")?;
            let ext_len = reader.u16("truncated extension header")? as usize;
            let data = reader.take(ext_len, "extension length exceeds extensions block")?;

            if ext_type == EXTENSION_SERVER_NAME {
                return parse_server_name(data).map(Some);
            }
        }

        Ok(None)
    }
}

/// Parse the server_name extension value.
///
/// - 2 bytes: list length
/// - 1 byte: name type (0 = host_name)
/// - 2 bytes: name length
/// - variable: name
fn parse_server_name(data: &[u8]) -> Result<&str, ConnectionError> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16("truncated server name list")? as usize;
    let mut list = Reader::new(reader.take(list_len, "server name list length exceeds extension")?);

    list.u8("truncated server name entry")?;
    let name_len = list.u16("truncated server name entry")? as usize;
    let name = list.take(name_len, "server name length exceeds list")?;

    if name.is_empty() {
        return Err(ConnectionError::MalformedClientHello("empty server name"));
    }
    if !name.is_ascii() {
        return Err(ConnectionError::MalformedClientHello(
            "server name is not ASCII",
        ));
    }

    std::str::from_utf8(name)
        .map_err(|_| ConnectionError::MalformedClientHello("server name is not ASCII"))
}

/// Big-endian cursor where every read is bounds-checked.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ConnectionError> {
        if n > self.data.len() {
            return Err(ConnectionError::MalformedClientHello(what));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ConnectionError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ConnectionError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, ConnectionError> {
        let b = self.take(3, what)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]) as usize)
    }
}
