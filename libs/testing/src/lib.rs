//! Test fixtures shared by unit and integration tests.
//!
//! The main export is [`ClientHelloBuilder`], which produces syntactically
//! valid TLS ClientHello messages without pulling in a TLS library.

/// TLS record content type for handshake messages.
pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name.
pub const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Builder for TLS ClientHello byte sequences.
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    server_name: Option<Vec<u8>>,
    session_id: Vec<u8>,
    cipher_suites: Vec<u16>,
    extensions_before: Vec<(u16, Vec<u8>)>,
    extensions_after: Vec<(u16, Vec<u8>)>,
    omit_extensions: bool,
    max_fragment: Option<usize>,
}

impl ClientHelloBuilder {
    /// A ClientHello with one cipher suite and no extensions.
    pub fn new() -> Self {
        Self {
            server_name: None,
            session_id: Vec::new(),
            cipher_suites: vec![0x1301, 0x002f],
            extensions_before: Vec::new(),
            extensions_after: Vec::new(),
            omit_extensions: false,
            max_fragment: None,
        }
    }

    /// Include a server_name extension carrying `name`.
    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.as_bytes().to_vec());
        self
    }

    /// Include a server_name extension carrying raw bytes.
    pub fn server_name_bytes(mut self, name: &[u8]) -> Self {
        self.server_name = Some(name.to_vec());
        self
    }

    /// Set the legacy session id.
    pub fn session_id(mut self, id: &[u8]) -> Self {
        self.session_id = id.to_vec();
        self
    }

    /// Add an extension placed before server_name.
    pub fn extension(mut self, ext_type: u16, data: &[u8]) -> Self {
        self.extensions_before.push((ext_type, data.to_vec()));
        self
    }

    /// Add an extension placed after server_name.
    pub fn trailing_extension(mut self, ext_type: u16, data: &[u8]) -> Self {
        self.extensions_after.push((ext_type, data.to_vec()));
        self
    }

    /// Omit the extensions block entirely (pre-TLS 1.0 style hello).
    pub fn without_extensions(mut self) -> Self {
        self.omit_extensions = true;
        self
    }

    /// Split the handshake message over records of at most `size` bytes.
    pub fn fragment(mut self, size: usize) -> Self {
        self.max_fragment = Some(size.max(1));
        self
    }

    /// The bare handshake message (type, 24-bit length, body).
    pub fn handshake_message(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend((0u8..32).map(|i| i.wrapping_mul(7)));

        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);

        body.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }

        // null compression only
        body.extend_from_slice(&[0x01, 0x00]);

        if !self.omit_extensions {
            let extensions = self.encode_extensions();
            body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
            body.extend_from_slice(&extensions);
        }

        let mut message = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);
        message
    }

    /// The full byte sequence as sent on the wire (one or more records).
    pub fn build(&self) -> Vec<u8> {
        let message = self.handshake_message();
        let chunk = self.max_fragment.unwrap_or(message.len()).max(1);

        let mut out = Vec::new();
        for fragment in message.chunks(chunk) {
            out.extend_from_slice(&record_header(fragment.len()));
            out.extend_from_slice(fragment);
        }
        out
    }

    fn encode_extensions(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (ext_type, data) in &self.extensions_before {
            push_extension(&mut out, *ext_type, data);
        }
        if let Some(name) = &self.server_name {
            push_extension(&mut out, EXTENSION_SERVER_NAME, &server_name_extension(name));
        }
        for (ext_type, data) in &self.extensions_after {
            push_extension(&mut out, *ext_type, data);
        }
        out
    }
}

impl Default for ClientHelloBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A TLS 1.0-versioned handshake record header for `len` payload bytes.
pub fn record_header(len: usize) -> [u8; 5] {
    let len = (len as u16).to_be_bytes();
    [RECORD_TYPE_HANDSHAKE, 0x03, 0x01, len[0], len[1]]
}

/// Encode a server_name extension body with a single host_name entry.
pub fn server_name_extension(name: &[u8]) -> Vec<u8> {
    let mut entry = vec![0x00];
    entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
    entry.extend_from_slice(name);

    let mut out = (entry.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(&entry);
    out
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}
