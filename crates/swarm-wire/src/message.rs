//! The closed set of protocol messages and their byte codecs.
//!
//! Every message travels as `[4B tag][body]` inside one framed payload.
//! Tags are fixed at compile time; an unknown tag is a decode error,
//! never a skip.

use crate::{
    encode_padded, put_opt_lp_str, Reader, Result, WireError, ID_WIDTH, MAX_FIELD_COUNT,
    NAME_WIDTH,
};

/// Reserved field name carrying an invocation's result.
pub const RETURN_FIELD: &str = "__return__";

pub const TAG_EVENT_INVOKE: u32 = 0;
pub const TAG_EVENT_FIELD: u32 = 1;
pub const TAG_KEEP_ALIVE: u32 = 2;
pub const TAG_HANDSHAKE: u32 = 3;
pub const TAG_HANDSHAKE_RESULT: u32 = 4;

/// Announces one event invocation: the correlation id, the event name,
/// and the names of the fields whose data will follow as [`EventField`]
/// messages on their own pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInvoke {
    pub id: String,
    pub event: String,
    pub fields: Vec<String>,
}

/// One value (or one stream chunk) for one field of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventField {
    pub id: String,
    pub event: String,
    pub field: String,
    pub is_stream: bool,
    pub is_stream_end: bool,
    /// When set, `data` carries an error message instead of a value.
    pub is_error: bool,
    pub data: Vec<u8>,
}

impl EventField {
    /// Correlation key routing this message to its waiting pipe.
    pub fn pipe_key(&self) -> String {
        pipe_key(&self.id, &self.event, &self.field)
    }
}

/// Builds the pipe key a field message is delivered under.
pub fn pipe_key(id: &str, event: &str, field: &str) -> String {
    format!("{id}:{event}:{field}")
}

/// Liveness probe. Sent periodically by the client side; the receiver
/// answers with `is_response` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Epoch milliseconds at send time.
    pub timestamp_ms: u64,
    pub is_response: bool,
}

/// First message on a fresh connection, client to server.
///
/// Optional string fields encode with a zero length prefix when absent,
/// so an empty string is indistinguishable from `None` on the wire and
/// decodes as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Correlation id the client waits on for the [`HandshakeResult`].
    pub pipe_id: String,
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    /// Present only when the sender is itself listening on a port.
    pub port: Option<u32>,
    pub auth: Option<String>,
}

/// Server's verdict on a [`Handshake`]. Peer identity fields are absent
/// on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub pipe_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub host: Option<String>,
    pub port: Option<u32>,
    pub success: bool,
    pub fail_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    EventInvoke(EventInvoke),
    EventField(EventField),
    KeepAlive(KeepAlive),
    Handshake(Handshake),
    HandshakeResult(HandshakeResult),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::EventInvoke(_) => "event_invoke",
            Message::EventField(_) => "event_field",
            Message::KeepAlive(_) => "keep_alive",
            Message::Handshake(_) => "handshake",
            Message::HandshakeResult(_) => "handshake_result",
        }
    }

    pub fn tag(&self) -> u32 {
        match self {
            Message::EventInvoke(_) => TAG_EVENT_INVOKE,
            Message::EventField(_) => TAG_EVENT_FIELD,
            Message::KeepAlive(_) => TAG_KEEP_ALIVE,
            Message::Handshake(_) => TAG_HANDSHAKE,
            Message::HandshakeResult(_) => TAG_HANDSHAKE_RESULT,
        }
    }

    /// Encode as `[4B tag][body]`, ready for frame splitting.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&self.tag().to_le_bytes());
        match self {
            Message::EventInvoke(m) => m.encode_body(&mut buf)?,
            Message::EventField(m) => m.encode_body(&mut buf)?,
            Message::KeepAlive(m) => m.encode_body(&mut buf),
            Message::Handshake(m) => m.encode_body(&mut buf)?,
            Message::HandshakeResult(m) => m.encode_body(&mut buf)?,
        }
        Ok(buf)
    }

    /// Decode a fully reassembled payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let tag = r.u32("message tag")?;
        match tag {
            TAG_EVENT_INVOKE => Ok(Message::EventInvoke(EventInvoke::decode_body(&mut r)?)),
            TAG_EVENT_FIELD => Ok(Message::EventField(EventField::decode_body(&mut r)?)),
            TAG_KEEP_ALIVE => Ok(Message::KeepAlive(KeepAlive::decode_body(&mut r)?)),
            TAG_HANDSHAKE => Ok(Message::Handshake(Handshake::decode_body(&mut r)?)),
            TAG_HANDSHAKE_RESULT => {
                Ok(Message::HandshakeResult(HandshakeResult::decode_body(&mut r)?))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

impl EventInvoke {
    // [32B id][128B event][4B field count]{[128B field name]}*
    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.fields.len() > MAX_FIELD_COUNT {
            return Err(WireError::TooLong {
                what: "field list",
                len: self.fields.len(),
                max: MAX_FIELD_COUNT,
            });
        }
        buf.extend_from_slice(&encode_padded(&self.id, ID_WIDTH, "invoke id")?);
        buf.extend_from_slice(&encode_padded(&self.event, NAME_WIDTH, "event name")?);
        buf.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for field in &self.fields {
            buf.extend_from_slice(&encode_padded(field, NAME_WIDTH, "field name")?);
        }
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self> {
        let id = r.padded_str(ID_WIDTH, "invoke id")?;
        let event = r.padded_str(NAME_WIDTH, "event name")?;
        let count = r.u32("field count")? as usize;
        if count > MAX_FIELD_COUNT {
            return Err(WireError::TooLong {
                what: "field list",
                len: count,
                max: MAX_FIELD_COUNT,
            });
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(r.padded_str(NAME_WIDTH, "field name")?);
        }
        Ok(Self { id, event, fields })
    }
}

const FIELD_FLAG_STREAM: u8 = 0x01;
const FIELD_FLAG_STREAM_END: u8 = 0x02;
const FIELD_FLAG_ERROR: u8 = 0x04;

impl EventField {
    // [32B id][128B event][128B field][1B flags][data]
    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&encode_padded(&self.id, ID_WIDTH, "field id")?);
        buf.extend_from_slice(&encode_padded(&self.event, NAME_WIDTH, "event name")?);
        buf.extend_from_slice(&encode_padded(&self.field, NAME_WIDTH, "field name")?);
        let mut flags = 0u8;
        if self.is_stream {
            flags |= FIELD_FLAG_STREAM;
        }
        if self.is_stream_end {
            flags |= FIELD_FLAG_STREAM_END;
        }
        if self.is_error {
            flags |= FIELD_FLAG_ERROR;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.data);
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self> {
        let id = r.padded_str(ID_WIDTH, "field id")?;
        let event = r.padded_str(NAME_WIDTH, "event name")?;
        let field = r.padded_str(NAME_WIDTH, "field name")?;
        let flags = r.u8("field flags")?;
        Ok(Self {
            id,
            event,
            field,
            is_stream: flags & FIELD_FLAG_STREAM != 0,
            is_stream_end: flags & FIELD_FLAG_STREAM_END != 0,
            is_error: flags & FIELD_FLAG_ERROR != 0,
            data: r.rest().to_vec(),
        })
    }
}

impl KeepAlive {
    // [8B timestamp_ms][1B is_response]
    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.push(u8::from(self.is_response));
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            timestamp_ms: r.u64("keep-alive timestamp")?,
            is_response: r.u8("keep-alive flag")? == 1,
        })
    }
}

impl Handshake {
    // lp(pipe_id) lp(name) lp?(description) lp(host) [4B port, 0=none] lp?(auth)
    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        put_opt_lp_str(buf, Some(&self.pipe_id));
        put_opt_lp_str(buf, Some(&self.name));
        put_opt_lp_str(buf, self.description.as_deref());
        put_opt_lp_str(buf, Some(&self.host));
        buf.extend_from_slice(&self.port.unwrap_or(0).to_le_bytes());
        put_opt_lp_str(buf, self.auth.as_deref());
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self> {
        let pipe_id = r.lp_str("pipe id")?;
        let name = r.lp_str("peer name")?;
        let description = r.opt_lp_str("peer description")?;
        let host = r.lp_str("peer host")?;
        let port = match r.u32("peer port")? {
            0 => None,
            p => Some(p),
        };
        let auth = r.opt_lp_str("auth token")?;
        Ok(Self {
            pipe_id,
            name,
            description,
            host,
            port,
            auth,
        })
    }
}

impl HandshakeResult {
    // lp(pipe_id) lp?(name) lp?(description) lp?(host) [4B port, 0=none]
    // [1B success] lp?(fail_reason)
    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        put_opt_lp_str(buf, Some(&self.pipe_id));
        put_opt_lp_str(buf, self.name.as_deref());
        put_opt_lp_str(buf, self.description.as_deref());
        put_opt_lp_str(buf, self.host.as_deref());
        buf.extend_from_slice(&self.port.unwrap_or(0).to_le_bytes());
        buf.push(u8::from(self.success));
        put_opt_lp_str(buf, self.fail_reason.as_deref());
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self> {
        let pipe_id = r.lp_str("pipe id")?;
        let name = r.opt_lp_str("peer name")?;
        let description = r.opt_lp_str("peer description")?;
        let host = r.opt_lp_str("peer host")?;
        let port = match r.u32("peer port")? {
            0 => None,
            p => Some(p),
        };
        let success = r.u8("handshake verdict")? == 1;
        let fail_reason = r.opt_lp_str("fail reason")?;
        Ok(Self {
            pipe_id,
            name,
            description,
            host,
            port,
            success,
            fail_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let bytes = msg.encode().unwrap();
        let back = Message::decode(&bytes).unwrap();
        assert_eq!(back, msg);
        back
    }

    #[test]
    fn event_invoke_roundtrip() {
        roundtrip(Message::EventInvoke(EventInvoke {
            id: "a".repeat(32),
            event: "compute".into(),
            fields: vec!["x".into(), "y".into()],
        }));
        // No fields at all is legal.
        roundtrip(Message::EventInvoke(EventInvoke {
            id: "b".repeat(32),
            event: "ping".into(),
            fields: vec![],
        }));
    }

    #[test]
    fn event_field_roundtrip_all_flags() {
        for (is_stream, is_stream_end, is_error) in [
            (false, false, false),
            (true, false, false),
            (true, true, false),
            (false, false, true),
        ] {
            roundtrip(Message::EventField(EventField {
                id: "c".repeat(32),
                event: "compute".into(),
                field: RETURN_FIELD.into(),
                is_stream,
                is_stream_end,
                is_error,
                data: vec![1, 2, 3],
            }));
        }
        // Empty data body survives too.
        roundtrip(Message::EventField(EventField {
            id: "c".repeat(32),
            event: "compute".into(),
            field: "x".into(),
            is_stream: true,
            is_stream_end: true,
            is_error: false,
            data: vec![],
        }));
    }

    #[test]
    fn keep_alive_roundtrip() {
        roundtrip(Message::KeepAlive(KeepAlive {
            timestamp_ms: 1_726_000_000_123,
            is_response: false,
        }));
        roundtrip(Message::KeepAlive(KeepAlive {
            timestamp_ms: 0,
            is_response: true,
        }));
    }

    #[test]
    fn handshake_roundtrip_with_and_without_optionals() {
        roundtrip(Message::Handshake(Handshake {
            pipe_id: "p".repeat(32),
            name: "svc-a".into(),
            description: Some("test peer".into()),
            host: "127.0.0.1".into(),
            port: Some(9000),
            auth: Some("secret".into()),
        }));
        roundtrip(Message::Handshake(Handshake {
            pipe_id: "q".repeat(32),
            name: "svc-b".into(),
            description: None,
            host: "localhost".into(),
            port: None,
            auth: None,
        }));
    }

    #[test]
    fn empty_optionals_decode_as_absent() {
        let bytes = Message::Handshake(Handshake {
            pipe_id: "s".repeat(32),
            name: "svc-c".into(),
            description: Some(String::new()),
            host: "127.0.0.1".into(),
            port: None,
            auth: Some(String::new()),
        })
        .encode()
        .unwrap();
        let Message::Handshake(back) = Message::decode(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(back.description, None);
        assert_eq!(back.auth, None);
    }

    #[test]
    fn handshake_result_roundtrip_failure_case() {
        roundtrip(Message::HandshakeResult(HandshakeResult {
            pipe_id: "r".repeat(32),
            name: None,
            description: None,
            host: None,
            port: None,
            success: false,
            fail_reason: Some("authentication failed".into()),
        }));
        roundtrip(Message::HandshakeResult(HandshakeResult {
            pipe_id: "r".repeat(32),
            name: Some("server".into()),
            description: None,
            host: Some("10.0.0.1".into()),
            port: Some(8080),
            success: true,
            fail_reason: None,
        }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = 99u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            Message::decode(&buf),
            Err(WireError::UnknownTag(99))
        ));
    }

    #[test]
    fn truncated_invoke_is_rejected() {
        let msg = Message::EventInvoke(EventInvoke {
            id: "a".repeat(32),
            event: "compute".into(),
            fields: vec!["x".into()],
        });
        let bytes = msg.encode().unwrap();
        for cut in [3, 10, 36, 165, bytes.len() - 1] {
            assert!(Message::decode(&bytes[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn oversized_field_count_rejected_before_allocation() {
        let mut buf = TAG_EVENT_INVOKE.to_le_bytes().to_vec();
        buf.extend_from_slice(&[b'a'; 32]);
        buf.extend_from_slice(&[0u8; 128]);
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Message::decode(&buf),
            Err(WireError::TooLong { what: "field list", .. })
        ));
    }

    #[test]
    fn overlong_event_name_rejected_on_encode() {
        let msg = Message::EventInvoke(EventInvoke {
            id: "a".repeat(32),
            event: "e".repeat(NAME_WIDTH + 1),
            fields: vec![],
        });
        assert!(matches!(
            msg.encode(),
            Err(WireError::TooLong { what: "event name", .. })
        ));
    }

    #[test]
    fn pipe_key_format() {
        let f = EventField {
            id: "abc".into(),
            event: "compute".into(),
            field: "x".into(),
            is_stream: false,
            is_stream_end: false,
            is_error: false,
            data: vec![],
        };
        assert_eq!(f.pipe_key(), "abc:compute:x");
    }
}
