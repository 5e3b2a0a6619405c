//! Purpose: Message value and its payload codec.
//! Exports: `Message`, `DeliveryMode`, `PRIORITY_LEVELS`, `DEFAULT_PRIORITY`, `peek_priority`.
//! Role: The byte (de)serializer between the message store and its linked store.
//! Invariants: Byte 0 of every payload is the priority, so a 1-byte header read is enough to order.
//! Invariants: Integers are little-endian; properties are a JSON object (empty = zero length).
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};

pub const PRIORITY_LEVELS: usize = 10;
pub const DEFAULT_PRIORITY: u8 = 4;

const FLAG_EXPIRATION: u8 = 0x01;
const FIXED_LEN: usize = 3;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    NonPersistent,
    #[default]
    Persistent,
}

impl DeliveryMode {
    fn to_byte(self) -> u8 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeliveryMode::NonPersistent),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Message {
    pub priority: u8,
    pub delivery_mode: DeliveryMode,
    pub message_id: String,
    /// Absolute expiry in epoch milliseconds.
    pub expiration_ms: Option<u64>,
    pub properties: Map<String, Value>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(priority: u8, body: impl Into<Vec<u8>>) -> Self {
        Self {
            priority,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        check_priority(self.priority)?;
        let id_len = u16::try_from(self.message_id.len())
            .map_err(|_| Error::new(ErrorKind::Usage).with_message("message id too long"))?;
        let properties = if self.properties.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.properties).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("failed to encode message properties")
                    .with_source(err)
            })?
        };
        let properties_len = u32::try_from(properties.len())
            .map_err(|_| Error::new(ErrorKind::Usage).with_message("message properties too large"))?;

        let mut out = Vec::with_capacity(
            FIXED_LEN + 2 + self.message_id.len() + 8 + 4 + properties.len() + self.body.len(),
        );
        let flags = if self.expiration_ms.is_some() {
            FLAG_EXPIRATION
        } else {
            0
        };
        out.push(self.priority);
        out.push(self.delivery_mode.to_byte());
        out.push(flags);
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(self.message_id.as_bytes());
        if let Some(expiration) = self.expiration_ms {
            out.extend_from_slice(&expiration.to_le_bytes());
        }
        out.extend_from_slice(&properties_len.to_le_bytes());
        out.extend_from_slice(&properties);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader { buf, offset: 0 };
        let priority = reader.u8()?;
        check_priority(priority).map_err(|_| corrupt("payload priority out of range"))?;
        let delivery_mode =
            DeliveryMode::from_byte(reader.u8()?).ok_or_else(|| corrupt("unknown delivery mode"))?;
        let flags = reader.u8()?;
        let id_len = u16::from_le_bytes(reader.array()?) as usize;
        let message_id = String::from_utf8(reader.take(id_len)?.to_vec())
            .map_err(|err| corrupt("message id is not utf-8").with_source(err))?;
        let expiration_ms = if flags & FLAG_EXPIRATION != 0 {
            Some(u64::from_le_bytes(reader.array()?))
        } else {
            None
        };
        let properties_len = u32::from_le_bytes(reader.array()?) as usize;
        let properties = match reader.take(properties_len)? {
            [] => Map::new(),
            bytes => serde_json::from_slice(bytes)
                .map_err(|err| corrupt("message properties are not a json object").with_source(err))?,
        };
        Ok(Self {
            priority,
            delivery_mode,
            message_id,
            expiration_ms,
            properties,
            body: reader.rest().to_vec(),
        })
    }
}

/// Reads the priority from a payload prefix without decoding the rest.
pub fn peek_priority(prefix: &[u8]) -> Result<u8, Error> {
    let priority = *prefix
        .first()
        .ok_or_else(|| corrupt("empty message payload"))?;
    check_priority(priority).map_err(|_| corrupt("payload priority out of range"))?;
    Ok(priority)
}

fn check_priority(priority: u8) -> Result<(), Error> {
    if priority as usize >= PRIORITY_LEVELS {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("priority must be 0..={}", PRIORITY_LEVELS - 1)));
    }
    Ok(())
}

fn corrupt(message: &str) -> Error {
    Error::new(ErrorKind::Corrupt).with_message(message)
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| corrupt("message payload truncated").with_offset(self.offset as u64))?;
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.offset..];
        self.offset = self.buf.len();
        bytes
    }
}
