//! Text protocol for canvas synchronization.
//!
//! Every frame is a newline-free UTF-8 string starting with a bracketed tag:
//! ```text
//! server → client   [MAP/SEND]                     begin full sync
//!                   [MAP/CHUNK:<seq>:<offset>]<hex>  one canvas slice
//!                   [MAP/END]                      full sync complete
//!                   [CANVAS]w:<int>,h:<int>        canvas dimensions
//! client → server   [MAP/RESEND:<seq>]             resend one chunk
//!                   [MAP/SYNC]                     fresh full sync
//!                   [NAME]<text>                   set display name
//!                   ...STOP]...                    close connection
//! both ways         [PIXEL]x:<int>,y:<int>,c:<0|1> set/clear one cell
//! ```
//!
//! Parsing produces a typed message or a [`ProtocolError`]; callers drop
//! anything that fails.

use thiserror::Error;

use crate::chunk::{self, ChunkError, DecodedChunk, CHUNK_TAG};

pub const SYNC_START: &str = "[MAP/SEND]";
pub const SYNC_END: &str = "[MAP/END]";
pub const SYNC_REQUEST: &str = "[MAP/SYNC]";
pub const RESEND_TAG: &str = "[MAP/RESEND:";
pub const NAME_TAG: &str = "[NAME]";
pub const PIXEL_TAG: &str = "[PIXEL]";
pub const CANVAS_TAG: &str = "[CANVAS]";
/// Any client frame containing this marker closes the connection.
pub const STOP_MARKER: &str = "STOP]";
/// Stop frame sent by [`SyncClient`](crate::client::SyncClient).
pub const CLIENT_STOP: &str = "[SOCKET/STOP]";

/// Longest display name kept after sanitizing.
pub const MAX_NAME_LEN: usize = 10;
/// Name used for connections that never set one.
pub const DEFAULT_NAME: &str = "Unknown";

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Message too long: {len} bytes (max {max})")]
    Oversized { len: usize, max: usize },
    #[error("Unknown message: {0}")]
    UnknownMessage(String),
    #[error(transparent)]
    MalformedChunk(#[from] ChunkError),
    #[error("Malformed pixel update: {0}")]
    MalformedPixel(String),
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("Cell ({x}, {y}) is outside the canvas")]
    OutOfBounds { x: u32, y: u32 },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// One cell write, as carried by `[PIXEL]` frames.
///
/// `color` is kept as received; only 0 and 1 are valid, which the server
/// checks separately from parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelUpdate {
    pub x: u32,
    pub y: u32,
    pub color: u32,
}

impl PixelUpdate {
    pub fn new(x: u32, y: u32, painted: bool) -> Self {
        Self {
            x,
            y,
            color: u32::from(painted),
        }
    }

    pub fn is_painted(&self) -> bool {
        self.color == 1
    }

    pub fn has_valid_color(&self) -> bool {
        self.color <= 1
    }

    pub fn to_wire(&self) -> String {
        format!("{PIXEL_TAG}x:{},y:{},c:{}", self.x, self.y, self.color)
    }

    /// Parse the body after `[PIXEL]`, e.g. `x:1,y:0,c:1`.
    fn parse_body(body: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedPixel(body.to_string());
        let rest = body.strip_prefix("x:").ok_or_else(malformed)?;
        let (x, rest) = rest.split_once(",y:").ok_or_else(malformed)?;
        let (y, color) = rest.split_once(",c:").ok_or_else(malformed)?;
        Ok(Self {
            x: parse_number(x)?,
            y: parse_number(y)?,
            color: parse_number(color)?,
        })
    }
}

/// Canvas dimensions advertised at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasInfo {
    pub width: u32,
    pub height: u32,
}

impl CanvasInfo {
    pub fn to_wire(&self) -> String {
        format!("{CANVAS_TAG}w:{},h:{}", self.width, self.height)
    }

    fn parse_body(body: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::UnknownMessage(format!("{CANVAS_TAG}{body}"));
        let rest = body.strip_prefix("w:").ok_or_else(malformed)?;
        let (width, height) = rest.split_once(",h:").ok_or_else(malformed)?;
        Ok(Self {
            width: parse_number(width)?,
            height: parse_number(height)?,
        })
    }
}

fn parse_number(field: &str) -> Result<u32, ProtocolError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidNumber(field.to_string()));
    }
    field
        .parse()
        .map_err(|_| ProtocolError::InvalidNumber(field.to_string()))
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Unsanitized display name text.
    Name(String),
    Pixel(PixelUpdate),
    Resend { sequence_id: u32 },
    SyncRequest,
    Stop,
}

impl ClientMessage {
    /// Parse a client frame, rejecting anything longer than `max_len` unread.
    ///
    /// Stop and resync markers are matched anywhere in the frame; the other
    /// tags must lead it.
    pub fn parse(raw: &str, max_len: usize) -> Result<Self, ProtocolError> {
        if raw.len() > max_len {
            return Err(ProtocolError::Oversized {
                len: raw.len(),
                max: max_len,
            });
        }
        if raw.contains(STOP_MARKER) {
            return Ok(Self::Stop);
        }
        if raw.contains(SYNC_REQUEST) {
            return Ok(Self::SyncRequest);
        }
        if let Some(rest) = raw.strip_prefix(RESEND_TAG) {
            let sequence = rest
                .strip_suffix(']')
                .ok_or_else(|| ProtocolError::UnknownMessage(raw.to_string()))?;
            return Ok(Self::Resend {
                sequence_id: parse_number(sequence)?,
            });
        }
        if let Some(name) = raw.strip_prefix(NAME_TAG) {
            return Ok(Self::Name(name.to_string()));
        }
        if let Some(body) = raw.strip_prefix(PIXEL_TAG) {
            return Ok(Self::Pixel(PixelUpdate::parse_body(body)?));
        }
        Err(ProtocolError::UnknownMessage(raw.to_string()))
    }

    pub fn to_wire(&self) -> String {
        match self {
            Self::Name(name) => format!("{NAME_TAG}{name}"),
            Self::Pixel(update) => update.to_wire(),
            Self::Resend { sequence_id } => format!("{RESEND_TAG}{sequence_id}]"),
            Self::SyncRequest => SYNC_REQUEST.to_string(),
            Self::Stop => CLIENT_STOP.to_string(),
        }
    }
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    SyncStart,
    Chunk(DecodedChunk),
    SyncEnd,
    Pixel(PixelUpdate),
    Canvas(CanvasInfo),
}

impl ServerMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.starts_with(SYNC_START) {
            return Ok(Self::SyncStart);
        }
        if raw.starts_with(CHUNK_TAG) {
            return Ok(Self::Chunk(chunk::decode(raw)?));
        }
        if raw.starts_with(SYNC_END) {
            return Ok(Self::SyncEnd);
        }
        if let Some(body) = raw.strip_prefix(PIXEL_TAG) {
            return Ok(Self::Pixel(PixelUpdate::parse_body(body)?));
        }
        if let Some(body) = raw.strip_prefix(CANVAS_TAG) {
            return Ok(Self::Canvas(CanvasInfo::parse_body(body)?));
        }
        Err(ProtocolError::UnknownMessage(raw.to_string()))
    }

    pub fn to_wire(&self) -> String {
        match self {
            Self::SyncStart => SYNC_START.to_string(),
            Self::Chunk(chunk) => chunk.to_wire(),
            Self::SyncEnd => SYNC_END.to_string(),
            Self::Pixel(update) => update.to_wire(),
            Self::Canvas(info) => info.to_wire(),
        }
    }
}

/// Strip whitespace and control characters and keep at most
/// [`MAX_NAME_LEN`] characters. Returns `None` when nothing is left.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let name: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 50;

    #[test]
    fn test_parse_pixel() {
        let msg = ClientMessage::parse("[PIXEL]x:1,y:0,c:1", MAX).unwrap();
        assert_eq!(msg, ClientMessage::Pixel(PixelUpdate::new(1, 0, true)));
    }

    #[test]
    fn test_parse_pixel_keeps_invalid_color() {
        // Color range is the server's call, not the parser's
        let msg = ClientMessage::parse("[PIXEL]x:3,y:4,c:7", MAX).unwrap();
        match msg {
            ClientMessage::Pixel(update) => {
                assert_eq!(update.color, 7);
                assert!(!update.has_valid_color());
            }
            other => panic!("Expected pixel, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_pixel_malformed() {
        for raw in [
            "[PIXEL]y:0,x:1,c:1",
            "[PIXEL]x:1,y:0",
            "[PIXEL]x:-1,y:0,c:1",
            "[PIXEL]x:1,y:0,c:",
            "[PIXEL]x:1,y:0,c:1 ",
            "[PIXEL]x:99999999999,y:0,c:1",
        ] {
            assert!(ClientMessage::parse(raw, MAX).is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn test_parse_oversized() {
        let raw = format!("[NAME]{}", "a".repeat(60));
        assert_eq!(
            ClientMessage::parse(&raw, MAX).unwrap_err(),
            ProtocolError::Oversized { len: 66, max: MAX }
        );
    }

    #[test]
    fn test_parse_stop_anywhere() {
        assert_eq!(ClientMessage::parse("[SOCKET/STOP]", MAX).unwrap(), ClientMessage::Stop);
        assert_eq!(ClientMessage::parse("xx[WS/STOP]yy", MAX).unwrap(), ClientMessage::Stop);
    }

    #[test]
    fn test_parse_sync_and_resend() {
        assert_eq!(
            ClientMessage::parse("[MAP/SYNC]", MAX).unwrap(),
            ClientMessage::SyncRequest
        );
        assert_eq!(
            ClientMessage::parse("[MAP/RESEND:12]", MAX).unwrap(),
            ClientMessage::Resend { sequence_id: 12 }
        );
        assert!(ClientMessage::parse("[MAP/RESEND:x]", MAX).is_err());
        assert!(ClientMessage::parse("[MAP/RESEND:3", MAX).is_err());
    }

    #[test]
    fn test_parse_name_and_unknown() {
        assert_eq!(
            ClientMessage::parse("[NAME]  Bob ", MAX).unwrap(),
            ClientMessage::Name("  Bob ".into())
        );
        assert!(matches!(
            ClientMessage::parse("Hello, Server!", MAX),
            Err(ProtocolError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_client_wire_forms() {
        assert_eq!(ClientMessage::Resend { sequence_id: 1 }.to_wire(), "[MAP/RESEND:1]");
        assert_eq!(ClientMessage::SyncRequest.to_wire(), "[MAP/SYNC]");
        assert_eq!(ClientMessage::Stop.to_wire(), "[SOCKET/STOP]");
        assert_eq!(ClientMessage::Name("Bob".into()).to_wire(), "[NAME]Bob");
        assert_eq!(
            ClientMessage::Pixel(PixelUpdate::new(10, 20, false)).to_wire(),
            "[PIXEL]x:10,y:20,c:0"
        );
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(ServerMessage::parse("[MAP/SEND]").unwrap(), ServerMessage::SyncStart);
        assert_eq!(ServerMessage::parse("[MAP/END]").unwrap(), ServerMessage::SyncEnd);
        assert_eq!(
            ServerMessage::parse("[PIXEL]x:1,y:2,c:0").unwrap(),
            ServerMessage::Pixel(PixelUpdate::new(1, 2, false))
        );
        assert_eq!(
            ServerMessage::parse("[CANVAS]w:200,h:100").unwrap(),
            ServerMessage::Canvas(CanvasInfo { width: 200, height: 100 })
        );
        match ServerMessage::parse("[MAP/CHUNK:2:112]0A0B").unwrap() {
            ServerMessage::Chunk(chunk) => {
                assert_eq!(chunk.sequence_id, 2);
                assert_eq!(chunk.byte_offset, Some(112));
                assert_eq!(chunk.bytes, vec![0x0A, 0x0B]);
            }
            other => panic!("Expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_server_malformed_chunk() {
        assert!(matches!(
            ServerMessage::parse("[MAP/CHUNK:2:112]0A0"),
            Err(ProtocolError::MalformedChunk(_))
        ));
    }

    #[test]
    fn test_server_wire_forms() {
        for raw in ["[MAP/SEND]", "[MAP/END]", "[PIXEL]x:5,y:6,c:1", "[CANVAS]w:4,h:4"] {
            assert_eq!(ServerMessage::parse(raw).unwrap().to_wire(), raw);
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("  Bob Smith123  ").as_deref(), Some("BobSmith12"));
        assert_eq!(sanitize_name("Flip\tper\n"), Some("Flipper".to_string()));
        assert_eq!(sanitize_name("   "), None);
        assert_eq!(sanitize_name(""), None);
        // Truncation counts characters, not bytes
        assert_eq!(sanitize_name("ééééééééééé").map(|n| n.chars().count()), Some(10));
    }
}
