//! Wire codec for protocol messages
//!
//! The outer [`Message`] frames every datagram: kind, message id, correlation
//! token, and an opaque payload. The inner [`Payload`] is the tagged
//! application payload carried inside; for application messages it is
//! encrypted between the codec and the transport, for handshake messages it
//! rides in plaintext. Both layers are pure functions of their input.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use crate::{
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    platform::{FirmwareStore, TransferDescriptor},
    DEVICE_ID_LEN, HMAC_LEN, MAX_EVENT_TTL, MAX_TOKEN_LENGTH, NONCE_LEN, SESSION_ID_LEN,
};

/// A datagram failed structural validation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Malformed;

impl From<UnexpectedEnd> for Malformed {
    fn from(_: UnexpectedEnd) -> Self {
        Malformed
    }
}

/// Transport-level message classification
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageKind {
    /// Session establishment traffic, never encrypted
    Handshake,
    /// Requires an `Acknowledgement`; retried on timeout
    Confirmable,
    /// Fire-and-forget
    NonConfirmable,
    /// Acknowledges a `Confirmable` by message id
    Acknowledgement,
    /// The peer rejected the session or a message
    Reset,
}

impl MessageKind {
    fn from_byte(x: u8) -> Option<Self> {
        Some(match x {
            0 => Self::Handshake,
            1 => Self::Confirmable,
            2 => Self::NonConfirmable,
            3 => Self::Acknowledgement,
            4 => Self::Reset,
            _ => return None,
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Handshake => 0,
            Self::Confirmable => 1,
            Self::NonConfirmable => 2,
            Self::Acknowledgement => 3,
            Self::Reset => 4,
        }
    }
}

/// Transport-level message identifier
///
/// Allocated monotonically per session and wraps at 65535. Unique among
/// messages currently awaiting acknowledgement.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub(crate) u16);

impl MessageId {
    pub(crate) fn next(&mut self) -> Self {
        let x = *self;
        self.0 = self.0.wrapping_add(1);
        x
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque correlation id linking a request to its eventual response
///
/// Independent of the transport-level message id; up to 8 bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LENGTH],
}

impl Token {
    /// The zero-length token
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; MAX_TOKEN_LENGTH],
    };

    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_TOKEN_LENGTH);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_TOKEN_LENGTH],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn from_counter(x: u16) -> Self {
        Self::new(&x.to_be_bytes())
    }

    /// Whether this token is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for Token {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One unit of wire exchange
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Message {
    pub kind: MessageKind,
    pub id: MessageId,
    pub token: Token,
    /// Ciphertext for application messages, plaintext for handshake traffic,
    /// empty for bare acknowledgements and pings
    pub payload: Bytes,
}

impl Message {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.kind.to_byte());
        buf.write(self.id.0);
        buf.write(self.token.len);
        buf.put_slice(&self.token);
        buf.write(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    /// Header bytes used as AAD for payload protection
    pub fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(4 + self.token.len as usize);
        aad.push(self.kind.to_byte());
        aad.extend_from_slice(&self.id.0.to_be_bytes());
        aad.push(self.token.len);
        aad.extend_from_slice(&self.token);
        aad
    }

    /// Decode one datagram
    ///
    /// Rejects unknown kinds, over-long tokens, declared lengths that do not
    /// match the buffer received, and datagrams exceeding `max_len`.
    pub fn decode(mut buf: &[u8], max_len: usize) -> Result<Self, Malformed> {
        if buf.len() > max_len {
            return Err(Malformed);
        }
        let buf = &mut buf;
        let kind = MessageKind::from_byte(buf.get::<u8>()?).ok_or(Malformed)?;
        let id = MessageId(buf.get::<u16>()?);
        let token_len = buf.get::<u8>()? as usize;
        if token_len > MAX_TOKEN_LENGTH {
            return Err(Malformed);
        }
        let token = Token::new(&buf.get_copy(token_len)?);
        let payload_len = buf.get::<u16>()? as usize;
        if buf.remaining() != payload_len {
            return Err(Malformed);
        }
        let payload = Bytes::copy_from_slice(&buf.get_copy(payload_len)?);
        Ok(Self {
            kind,
            id,
            token,
            payload,
        })
    }
}

/// Typed value of a registered variable
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean variable
    Bool(bool),
    /// 32-bit signed integer variable
    Int(i32),
    /// Double-precision float variable
    Double(f64),
    /// String variable
    Str(String),
}

impl Value {
    /// Wire code for the value's type, also used in `Description` payloads
    pub(crate) fn type_byte(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) => 1,
            Self::Double(_) => 2,
            Self::Str(_) => 3,
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.type_byte());
        match self {
            Self::Bool(x) => buf.write(u8::from(*x)),
            Self::Int(x) => buf.write(*x as u32),
            Self::Double(x) => buf.write(x.to_bits()),
            Self::Str(x) => put_str(buf, x),
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, Malformed> {
        Ok(match buf.get::<u8>()? {
            0 => Self::Bool(buf.get::<u8>()? != 0),
            1 => Self::Int(buf.get::<u32>()? as i32),
            2 => Self::Double(f64::from_bits(buf.get::<u64>()?)),
            3 => Self::Str(get_str(buf)?),
            _ => return Err(Malformed),
        })
    }
}

/// Whether an event is visible beyond the publishing account
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventVisibility {
    /// Visible to any subscriber
    Public,
    /// Visible only to the owning account's subscribers
    Private,
}

/// Whether a publish demands transport-level acknowledgement
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventDelivery {
    /// Confirmable publish, subject to retry and `MessageTimeout`
    AckRequired,
    /// Fire-and-forget
    NoAck,
}

/// Flags attached to a published event
///
/// Modeled as a proper struct; packed into one byte only at the codec
/// boundary.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EventFlags {
    /// Event visibility
    pub visibility: EventVisibility,
    /// Delivery guarantee
    pub delivery: EventDelivery,
}

impl EventFlags {
    /// Public, fire-and-forget
    pub const PUBLIC: Self = Self {
        visibility: EventVisibility::Public,
        delivery: EventDelivery::NoAck,
    };
    /// Private, fire-and-forget
    pub const PRIVATE: Self = Self {
        visibility: EventVisibility::Private,
        delivery: EventDelivery::NoAck,
    };

    /// Same visibility, with acknowledgement required
    pub fn with_ack(self) -> Self {
        Self {
            delivery: EventDelivery::AckRequired,
            ..self
        }
    }

    fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.visibility == EventVisibility::Private {
            bits |= 0x01;
        }
        if self.delivery == EventDelivery::AckRequired {
            bits |= 0x02;
        }
        bits
    }

    fn from_bits(bits: u8) -> Result<Self, Malformed> {
        if bits & !0x03 != 0 {
            return Err(Malformed);
        }
        Ok(Self {
            visibility: if bits & 0x01 != 0 {
                EventVisibility::Private
            } else {
                EventVisibility::Public
            },
            delivery: if bits & 0x02 != 0 {
                EventDelivery::AckRequired
            } else {
                EventDelivery::NoAck
            },
        })
    }
}

/// Scope of an event subscription
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubscriptionScope {
    /// Events from devices owned by the same account
    MyDevices,
    /// All public events matching the filter
    Firehose,
}

impl SubscriptionScope {
    fn from_byte(x: u8) -> Result<Self, Malformed> {
        Ok(match x {
            0 => Self::MyDevices,
            1 => Self::Firehose,
            _ => return Err(Malformed),
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::MyDevices => 0,
            Self::Firehose => 1,
        }
    }
}

/// Application error codes carried in `Error` payloads
pub(crate) mod app_error {
    pub const NOT_FOUND: u8 = 0;
    pub const INVOCATION_FAILED: u8 = 1;
    pub const BAD_REQUEST: u8 = 2;
    pub const INVALID_STATE: u8 = 3;
    pub const INSUFFICIENT_STORAGE: u8 = 4;
    pub const CHECKSUM_MISMATCH: u8 = 5;
}

/// A payload tag byte
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct PayloadTag(u8);

macro_rules! payload_tags {
    {$($name:ident = $val:expr,)*} => {
        impl PayloadTag {
            $(pub(crate) const $name: PayloadTag = PayloadTag($val);)*
        }

        impl fmt::Debug for PayloadTag {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Tag({:02x})", self.0),
                }
            }
        }
    }
}

payload_tags! {
    HELLO_DEVICE = 0x01,
    HELLO_CLOUD = 0x02,
    HANDSHAKE_FINISH = 0x03,
    TIME_REQUEST = 0x10,
    TIME = 0x11,
    FUNCTION_CALL = 0x20,
    FUNCTION_RETURN = 0x21,
    VARIABLE_REQUEST = 0x22,
    VARIABLE_VALUE = 0x23,
    DESCRIBE = 0x24,
    DESCRIPTION = 0x25,
    ERROR = 0x26,
    EVENT = 0x30,
    SUBSCRIBE = 0x31,
    UPDATE_BEGIN = 0x40,
    UPDATE_READY = 0x41,
    UPDATE_CHUNK = 0x42,
    UPDATE_FINISH = 0x43,
    UPDATE_ABORT = 0x44,
    MISSING_CHUNKS = 0x45,
    UPDATE_DONE = 0x46,
    GOODBYE = 0x50,
}

/// Application payload carried inside a [`Message`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    /// Device opens a handshake; `resume_id` of all zeroes offers none
    HelloDevice {
        device_id: [u8; DEVICE_ID_LEN],
        nonce: [u8; NONCE_LEN],
        resume_id: [u8; SESSION_ID_LEN],
    },
    /// Cloud's half of the handshake
    HelloCloud {
        nonce: [u8; NONCE_LEN],
        resume_ok: bool,
    },
    /// Key-confirmation HMAC over both nonces
    HandshakeFinish { hmac: [u8; HMAC_LEN] },
    TimeRequest,
    Time { unix_seconds: u64 },
    FunctionCall { key: String, arg: String },
    FunctionReturn { value: i32 },
    VariableRequest { key: String },
    VariableValue { value: Value },
    Describe,
    Description {
        functions: Vec<String>,
        variables: Vec<(String, u8)>,
    },
    Error { code: u8 },
    Event {
        name: String,
        data: String,
        ttl: u32,
        flags: EventFlags,
    },
    Subscribe {
        filter: String,
        scope: SubscriptionScope,
        device_id: Option<String>,
    },
    UpdateBegin {
        desc: TransferDescriptor,
        dry_run: bool,
    },
    UpdateReady,
    UpdateChunk { index: u32, data: Bytes },
    UpdateFinish,
    UpdateAbort,
    MissingChunks { indices: Vec<u32> },
    UpdateDone,
    Goodbye,
}

impl Payload {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::HelloDevice {
                device_id,
                nonce,
                resume_id,
            } => {
                buf.write(PayloadTag::HELLO_DEVICE.0);
                buf.put_slice(device_id);
                buf.put_slice(nonce);
                buf.put_slice(resume_id);
            }
            Self::HelloCloud { nonce, resume_ok } => {
                buf.write(PayloadTag::HELLO_CLOUD.0);
                buf.put_slice(nonce);
                buf.write(u8::from(*resume_ok));
            }
            Self::HandshakeFinish { hmac } => {
                buf.write(PayloadTag::HANDSHAKE_FINISH.0);
                buf.put_slice(hmac);
            }
            Self::TimeRequest => buf.write(PayloadTag::TIME_REQUEST.0),
            Self::Time { unix_seconds } => {
                buf.write(PayloadTag::TIME.0);
                buf.write(*unix_seconds);
            }
            Self::FunctionCall { key, arg } => {
                buf.write(PayloadTag::FUNCTION_CALL.0);
                put_str(buf, key);
                put_str(buf, arg);
            }
            Self::FunctionReturn { value } => {
                buf.write(PayloadTag::FUNCTION_RETURN.0);
                buf.write(*value as u32);
            }
            Self::VariableRequest { key } => {
                buf.write(PayloadTag::VARIABLE_REQUEST.0);
                put_str(buf, key);
            }
            Self::VariableValue { value } => {
                buf.write(PayloadTag::VARIABLE_VALUE.0);
                value.encode(buf);
            }
            Self::Describe => buf.write(PayloadTag::DESCRIBE.0),
            Self::Description {
                functions,
                variables,
            } => {
                buf.write(PayloadTag::DESCRIPTION.0);
                buf.write(functions.len() as u8);
                for key in functions {
                    put_str(buf, key);
                }
                buf.write(variables.len() as u8);
                for (key, ty) in variables {
                    put_str(buf, key);
                    buf.write(*ty);
                }
            }
            Self::Error { code } => {
                buf.write(PayloadTag::ERROR.0);
                buf.write(*code);
            }
            Self::Event {
                name,
                data,
                ttl,
                flags,
            } => {
                buf.write(PayloadTag::EVENT.0);
                put_str(buf, name);
                put_str(buf, data);
                buf.put_uint(u64::from(*ttl), 3);
                buf.write(flags.to_bits());
            }
            Self::Subscribe {
                filter,
                scope,
                device_id,
            } => {
                buf.write(PayloadTag::SUBSCRIBE.0);
                put_str(buf, filter);
                buf.write(scope.to_byte());
                put_str(buf, device_id.as_deref().unwrap_or(""));
            }
            Self::UpdateBegin { desc, dry_run } => {
                buf.write(PayloadTag::UPDATE_BEGIN.0);
                buf.write(desc.store.to_byte());
                buf.write(desc.file_length);
                buf.write(desc.chunk_size);
                buf.write(desc.crc);
                buf.write(u8::from(*dry_run));
            }
            Self::UpdateReady => buf.write(PayloadTag::UPDATE_READY.0),
            Self::UpdateChunk { index, data } => {
                buf.write(PayloadTag::UPDATE_CHUNK.0);
                buf.write(*index);
                buf.write(data.len() as u16);
                buf.put_slice(data);
            }
            Self::UpdateFinish => buf.write(PayloadTag::UPDATE_FINISH.0),
            Self::UpdateAbort => buf.write(PayloadTag::UPDATE_ABORT.0),
            Self::MissingChunks { indices } => {
                buf.write(PayloadTag::MISSING_CHUNKS.0);
                buf.write(indices.len() as u8);
                for index in indices {
                    buf.write(*index);
                }
            }
            Self::UpdateDone => buf.write(PayloadTag::UPDATE_DONE.0),
            Self::Goodbye => buf.write(PayloadTag::GOODBYE.0),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Malformed> {
        let buf = &mut buf;
        let tag = PayloadTag(buf.get::<u8>()?);
        let payload = match tag {
            PayloadTag::HELLO_DEVICE => Self::HelloDevice {
                device_id: buf.get_array()?,
                nonce: buf.get_array()?,
                resume_id: buf.get_array()?,
            },
            PayloadTag::HELLO_CLOUD => Self::HelloCloud {
                nonce: buf.get_array()?,
                resume_ok: buf.get::<u8>()? != 0,
            },
            PayloadTag::HANDSHAKE_FINISH => Self::HandshakeFinish {
                hmac: buf.get_array()?,
            },
            PayloadTag::TIME_REQUEST => Self::TimeRequest,
            PayloadTag::TIME => Self::Time {
                unix_seconds: buf.get::<u64>()?,
            },
            PayloadTag::FUNCTION_CALL => Self::FunctionCall {
                key: get_str(buf)?,
                arg: get_str(buf)?,
            },
            PayloadTag::FUNCTION_RETURN => Self::FunctionReturn {
                value: buf.get::<u32>()? as i32,
            },
            PayloadTag::VARIABLE_REQUEST => Self::VariableRequest {
                key: get_str(buf)?,
            },
            PayloadTag::VARIABLE_VALUE => Self::VariableValue {
                value: Value::decode(buf)?,
            },
            PayloadTag::DESCRIBE => Self::Describe,
            PayloadTag::DESCRIPTION => {
                let count = buf.get::<u8>()?;
                let mut functions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    functions.push(get_str(buf)?);
                }
                let count = buf.get::<u8>()?;
                let mut variables = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    variables.push((get_str(buf)?, buf.get::<u8>()?));
                }
                Self::Description {
                    functions,
                    variables,
                }
            }
            PayloadTag::ERROR => Self::Error {
                code: buf.get::<u8>()?,
            },
            PayloadTag::EVENT => {
                let name = get_str(buf)?;
                let data = get_str(buf)?;
                if buf.remaining() < 4 {
                    return Err(Malformed);
                }
                let ttl = buf.get_uint(3) as u32;
                if ttl > MAX_EVENT_TTL {
                    return Err(Malformed);
                }
                Self::Event {
                    name,
                    data,
                    ttl,
                    flags: EventFlags::from_bits(buf.get::<u8>()?)?,
                }
            }
            PayloadTag::SUBSCRIBE => {
                let filter = get_str(buf)?;
                let scope = SubscriptionScope::from_byte(buf.get::<u8>()?)?;
                let device_id = get_str(buf)?;
                Self::Subscribe {
                    filter,
                    scope,
                    device_id: if device_id.is_empty() {
                        None
                    } else {
                        Some(device_id)
                    },
                }
            }
            PayloadTag::UPDATE_BEGIN => {
                let store = FirmwareStore::from_byte(buf.get::<u8>()?).ok_or(Malformed)?;
                Self::UpdateBegin {
                    desc: TransferDescriptor {
                        store,
                        file_length: buf.get::<u32>()?,
                        chunk_size: buf.get::<u16>()?,
                        crc: buf.get::<u32>()?,
                    },
                    dry_run: buf.get::<u8>()? != 0,
                }
            }
            PayloadTag::UPDATE_READY => Self::UpdateReady,
            PayloadTag::UPDATE_CHUNK => {
                let index = buf.get::<u32>()?;
                let len = buf.get::<u16>()? as usize;
                Self::UpdateChunk {
                    index,
                    data: Bytes::from(buf.get_copy(len)?),
                }
            }
            PayloadTag::UPDATE_FINISH => Self::UpdateFinish,
            PayloadTag::UPDATE_ABORT => Self::UpdateAbort,
            PayloadTag::MISSING_CHUNKS => {
                let count = buf.get::<u8>()?;
                let mut indices = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    indices.push(buf.get::<u32>()?);
                }
                Self::MissingChunks { indices }
            }
            PayloadTag::UPDATE_DONE => Self::UpdateDone,
            PayloadTag::GOODBYE => Self::Goodbye,
            _ => return Err(Malformed),
        };
        if buf.has_remaining() {
            return Err(Malformed);
        }
        Ok(payload)
    }
}

fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn get_str<B: Buf>(buf: &mut B) -> Result<String, Malformed> {
    let len = buf.get::<u8>()? as usize;
    let bytes = buf.get_copy(len)?;
    String::from_utf8(bytes).map_err(|_| Malformed)
}
