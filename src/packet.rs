//! The Socket.IO v5 packet codec.
//!
//! Wire grammar:
//! ```text
//! packet      = type [ attachments "-" ] [ nsp "," ] [ ackid ] [ payload ]
//! type        = "0" | "1" | "2" | "3" | "4" | "5" | "6"
//! attachments = 1*DIGIT         ; only for types 5,6
//! nsp         = "/" *nsp-char
//! ackid       = 1*DIGIT
//! payload     = JSON
//! ```
//!
//! The binary-placeholder walker lives entirely in this module: callers
//! hand in [`ArgValue::Binary`] leaves mixed into an event's argument list,
//! and the codec is responsible for splitting them into attachment frames
//! on encode and splicing them back in on decode. Nothing above this layer
//! (the Adapter, the Namespace, …) ever sees a placeholder object.

use serde_json::{json, Value};

use crate::channel::Frame;
use crate::error::DecodeError;

/// Event names reserved for lifecycle signaling; forbidden both inbound and
/// outbound as data events.
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connecting",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

pub fn is_reserved_event(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// One argument passed to `emit`: either a plain JSON value or a raw binary
/// blob that will travel as its own attachment frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Json(Value),
    Binary(Vec<u8>),
}

impl From<Value> for ArgValue {
    fn from(v: Value) -> Self {
        ArgValue::Json(v)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(v: Vec<u8>) -> Self {
        ArgValue::Binary(v)
    }
}

/// An event name plus its argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub event: String,
    pub args: Vec<Value>,
}

/// A fully decoded/ready-to-encode packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub ns: String,
    pub ack_id: Option<i64>,
    pub inner: PacketData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Connect(Option<Value>),
    Disconnect,
    Event(EventPayload),
    Ack(Vec<Value>),
    ConnectError(Value),
    BinaryEvent(EventPayload, Vec<Vec<u8>>),
    BinaryAck(Vec<Value>, Vec<Vec<u8>>),
}

impl PacketData {
    fn type_digit(&self) -> u8 {
        match self {
            PacketData::Connect(_) => 0,
            PacketData::Disconnect => 1,
            PacketData::Event(_) => 2,
            PacketData::Ack(_) => 3,
            PacketData::ConnectError(_) => 4,
            PacketData::BinaryEvent(_, _) => 5,
            PacketData::BinaryAck(_, _) => 6,
        }
    }

    fn attachments(&self) -> Option<&[Vec<u8>]> {
        match self {
            PacketData::BinaryEvent(_, bin) | PacketData::BinaryAck(_, bin) => Some(bin),
            _ => None,
        }
    }
}

/// Splits a mixed arg list into a JSON value tree with placeholders plus an
/// ordered list of the binary blobs that were pulled out of it.
fn split_attachments(args: Vec<ArgValue>) -> (Vec<Value>, Vec<Vec<u8>>) {
    let mut values = Vec::with_capacity(args.len());
    let mut attachments = Vec::new();
    for arg in args {
        match arg {
            ArgValue::Json(v) => values.push(v),
            ArgValue::Binary(bytes) => {
                let num = attachments.len();
                attachments.push(bytes);
                values.push(json!({ "_placeholder": true, "num": num }));
            }
        }
    }
    (values, attachments)
}

/// Reverses [`split_attachments`]: walks the JSON value tree and replaces
/// each placeholder object with a reference to its attachment. The
/// attachments themselves are not re-embedded in the `Value` (JSON can't
/// hold raw bytes); callers that need them look them up in the sibling
/// `Vec<Vec<u8>>` by position, matching how [`PacketData::BinaryEvent`] and
/// [`PacketData::BinaryAck`] carry them.
fn is_placeholder(v: &Value) -> Option<usize> {
    let obj = v.as_object()?;
    if obj.get("_placeholder")?.as_bool()? {
        obj.get("num")?.as_u64().map(|n| n as usize)
    } else {
        None
    }
}

impl Packet {
    pub fn connect(ns: impl Into<String>, auth: Option<Value>) -> Self {
        Self {
            ns: ns.into(),
            ack_id: None,
            inner: PacketData::Connect(auth),
        }
    }

    pub fn connect_error(ns: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            ack_id: None,
            inner: PacketData::ConnectError(json!({ "message": message.into() })),
        }
    }

    pub fn disconnect(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            ack_id: None,
            inner: PacketData::Disconnect,
        }
    }

    pub fn event(ns: impl Into<String>, event: impl Into<String>, args: Vec<ArgValue>) -> Self {
        let (values, attachments) = split_attachments(args);
        let payload = EventPayload {
            event: event.into(),
            args: values,
        };
        let inner = if attachments.is_empty() {
            PacketData::Event(payload)
        } else {
            PacketData::BinaryEvent(payload, attachments)
        };
        Self {
            ns: ns.into(),
            ack_id: None,
            inner,
        }
    }

    pub fn ack(ns: impl Into<String>, ack_id: i64, args: Vec<ArgValue>) -> Self {
        let (values, attachments) = split_attachments(args);
        let inner = if attachments.is_empty() {
            PacketData::Ack(values)
        } else {
            PacketData::BinaryAck(values, attachments)
        };
        Self {
            ns: ns.into(),
            ack_id: Some(ack_id),
            inner,
        }
    }

    pub fn with_ack_id(mut self, ack_id: i64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    /// Encodes this packet into one text frame followed by zero or more
    /// binary frames, in dispatch order.
    pub fn encode(&self) -> Vec<Frame> {
        let mut header = String::new();
        header.push((b'0' + self.inner.type_digit()) as char);

        if let Some(bin) = self.inner.attachments() {
            header.push_str(&bin.len().to_string());
            header.push('-');
        }

        if self.ns != "/" {
            header.push_str(&self.ns);
            header.push(',');
        }

        if let Some(id) = self.ack_id {
            header.push_str(&id.to_string());
        }

        if let Some(payload) = self.payload_json() {
            header.push_str(&payload.to_string());
        }

        let mut frames = vec![Frame::Text(header)];
        if let Some(bin) = self.inner.attachments() {
            frames.extend(bin.iter().cloned().map(Frame::Binary));
        }
        frames
    }

    fn payload_json(&self) -> Option<Value> {
        match &self.inner {
            PacketData::Connect(auth) => auth.clone(),
            PacketData::Disconnect => None,
            PacketData::Event(p) => Some(event_array(&p.event, &p.args)),
            PacketData::BinaryEvent(p, _) => Some(event_array(&p.event, &p.args)),
            PacketData::Ack(args) => Some(Value::Array(args.clone())),
            PacketData::BinaryAck(args, _) => Some(Value::Array(args.clone())),
            PacketData::ConnectError(v) => Some(v.clone()),
        }
    }
}

fn event_array(event: &str, args: &[Value]) -> Value {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(event.to_string()));
    items.extend_from_slice(args);
    Value::Array(items)
}

/// Result of feeding one frame into a [`Decoder`].
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete packet with no attachments, or the last attachment just
    /// arrived and completed a pending one.
    Complete(Packet),
    /// Waiting for more binary attachment frames.
    Pending,
}

#[derive(Debug)]
struct PendingBinary {
    ns: String,
    ack_id: Option<i64>,
    kind: PendingBinaryKind,
    values: Value,
    needed: usize,
    attachments: Vec<Vec<u8>>,
}

#[derive(Debug)]
enum PendingBinaryKind {
    Event(String),
    Ack,
}

/// Per-connection decoder. Holds at most one pending binary-attachment
/// assembly at a time, which is correct because a single `MessageChannel`
/// delivers frames strictly sequentially.
#[derive(Debug, Default)]
pub struct Decoder {
    pending: Option<PendingBinary>,
}

impl Decoder {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn decode(&mut self, frame: Frame) -> Result<DecodeOutcome, DecodeError> {
        match frame {
            Frame::Text(text) => self.decode_text(&text),
            Frame::Binary(bytes) => self.decode_binary(bytes),
        }
    }

    fn decode_text(&mut self, text: &str) -> Result<DecodeOutcome, DecodeError> {
        if self.pending.is_some() {
            return Err(DecodeError::MalformedFrame(
                "text frame arrived while binary attachments were pending".into(),
            ));
        }

        let mut chars = text.char_indices();
        let (_, type_char) = chars
            .next()
            .ok_or_else(|| DecodeError::MalformedFrame("empty frame".into()))?;
        let type_digit = type_char
            .to_digit(10)
            .ok_or(DecodeError::UnknownType(type_char))?;
        if !(0..=6).contains(&type_digit) {
            return Err(DecodeError::UnknownType(type_char));
        }
        let mut rest = chars.as_str();

        let mut attachment_count = 0usize;
        let is_binary_type = type_digit == 5 || type_digit == 6;
        if is_binary_type {
            let dash = rest
                .find('-')
                .ok_or_else(|| DecodeError::MalformedFrame("missing attachment count".into()))?;
            attachment_count = rest[..dash]
                .parse()
                .map_err(|_| DecodeError::MalformedFrame("bad attachment count".into()))?;
            rest = &rest[dash + 1..];
        }

        let ns = if let Some(stripped) = rest.strip_prefix('/') {
            let end = stripped
                .find(',')
                .ok_or_else(|| DecodeError::MalformedFrame("unterminated namespace".into()))?;
            let ns = format!("/{}", &stripped[..end]);
            rest = &stripped[end + 1..];
            ns
        } else {
            "/".to_string()
        };

        let mut digit_end = 0;
        for (i, c) in rest.char_indices() {
            if c.is_ascii_digit() {
                digit_end = i + c.len_utf8();
            } else {
                break;
            }
        }
        let ack_id = if digit_end > 0 {
            Some(
                rest[..digit_end]
                    .parse::<i64>()
                    .map_err(|_| DecodeError::MalformedFrame("bad ack id".into()))?,
            )
        } else {
            None
        };
        rest = &rest[digit_end..];

        let payload: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| DecodeError::MalformedFrame(e.to_string()))?,
            )
        };

        match type_digit {
            0 => Ok(DecodeOutcome::Complete(Packet {
                ns,
                ack_id,
                inner: PacketData::Connect(payload),
            })),
            1 => Ok(DecodeOutcome::Complete(Packet {
                ns,
                ack_id,
                inner: PacketData::Disconnect,
            })),
            2 => {
                let (event, args) = split_event_array(payload)?;
                Ok(DecodeOutcome::Complete(Packet {
                    ns,
                    ack_id,
                    inner: PacketData::Event(EventPayload { event, args }),
                }))
            }
            3 => {
                let args = match payload {
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(DecodeError::MalformedFrame("ack payload must be array".into()))
                    }
                    None => Vec::new(),
                };
                Ok(DecodeOutcome::Complete(Packet {
                    ns,
                    ack_id,
                    inner: PacketData::Ack(args),
                }))
            }
            4 => Ok(DecodeOutcome::Complete(Packet {
                ns,
                ack_id,
                inner: PacketData::ConnectError(payload.unwrap_or(Value::Null)),
            })),
            5 => {
                let (event, args) = split_event_array(payload)?;
                if is_reserved_event(&event) {
                    return Err(DecodeError::ReservedEvent(event));
                }
                if attachment_count == 0 {
                    return Ok(DecodeOutcome::Complete(Packet {
                        ns,
                        ack_id,
                        inner: PacketData::BinaryEvent(EventPayload { event, args }, Vec::new()),
                    }));
                }
                self.pending = Some(PendingBinary {
                    ns,
                    ack_id,
                    kind: PendingBinaryKind::Event(event),
                    values: Value::Array(args),
                    needed: attachment_count,
                    attachments: Vec::new(),
                });
                Ok(DecodeOutcome::Pending)
            }
            6 => {
                let args = match payload {
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(DecodeError::MalformedFrame(
                            "binary ack payload must be array".into(),
                        ))
                    }
                    None => Vec::new(),
                };
                if attachment_count == 0 {
                    return Ok(DecodeOutcome::Complete(Packet {
                        ns,
                        ack_id,
                        inner: PacketData::BinaryAck(args, Vec::new()),
                    }));
                }
                self.pending = Some(PendingBinary {
                    ns,
                    ack_id,
                    kind: PendingBinaryKind::Ack,
                    values: Value::Array(args),
                    needed: attachment_count,
                    attachments: Vec::new(),
                });
                Ok(DecodeOutcome::Pending)
            }
            _ => Err(DecodeError::UnknownType(type_char)),
        }
    }

    fn decode_binary(&mut self, bytes: Vec<u8>) -> Result<DecodeOutcome, DecodeError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or(DecodeError::UnexpectedAttachment)?;
        pending.attachments.push(bytes);
        if pending.attachments.len() < pending.needed {
            return Ok(DecodeOutcome::Pending);
        }

        let PendingBinary {
            ns,
            ack_id,
            kind,
            values,
            attachments,
            ..
        } = self.pending.take().unwrap();

        let args = match values {
            Value::Array(items) => items,
            _ => unreachable!("pending values are always constructed as an array"),
        };

        let inner = match kind {
            PendingBinaryKind::Event(event) => {
                PacketData::BinaryEvent(EventPayload { event, args }, attachments)
            }
            PendingBinaryKind::Ack => PacketData::BinaryAck(args, attachments),
        };

        Ok(DecodeOutcome::Complete(Packet { ns, ack_id, inner }))
    }
}

fn split_event_array(payload: Option<Value>) -> Result<(String, Vec<Value>), DecodeError> {
    let mut items = match payload {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(DecodeError::MalformedFrame("event payload must be array".into())),
        None => return Err(DecodeError::MalformedFrame("event payload missing".into())),
    };
    if items.is_empty() {
        return Err(DecodeError::MalformedFrame("event array is empty".into()));
    }
    let event = match items.remove(0) {
        Value::String(s) => s,
        _ => return Err(DecodeError::MalformedFrame("event name must be a string".into())),
    };
    if is_reserved_event(&event) {
        return Err(DecodeError::ReservedEvent(event));
    }
    Ok((event, items))
}

/// Resolves a placeholder object in a decoded `Value` tree to the matching
/// attachment, if any. Exposed for callers that want to walk a `BinaryEvent`
/// / `BinaryAck` payload themselves (e.g. to deserialize a typed argument
/// that embeds a blob) without duplicating the placeholder convention.
pub fn resolve_placeholder<'a>(value: &Value, attachments: &'a [Vec<u8>]) -> Option<&'a [u8]> {
    is_placeholder(value).and_then(|num| attachments.get(num)).map(|v| v.as_slice())
}
