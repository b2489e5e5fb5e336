//! Wire codec for the two message envelopes.
//!
//! Both envelopes open with a version byte followed by tagged fields. A tag
//! byte carries the field number in its high bits and the wire type in its
//! low three bits: type 0 fields are base-128 varints, type 2 fields are
//! length-prefixed byte strings. Unknown fields of either type are skipped
//! so the format can grow without breaking old readers.
//!
//! A MESSAGE body additionally carries a fixed-length MAC after the framed
//! region; the codec leaves it unparsed for the cipher to verify.

use std::ops::Range;

/// Version byte emitted on every message.
pub const PROTOCOL_VERSION: u8 = 0x03;

const RATCHET_KEY_TAG: u8 = 0x0A;
const COUNTER_TAG: u8 = 0x10;
const CIPHERTEXT_TAG: u8 = 0x22;

const ONE_TIME_KEY_ID_TAG: u8 = 0x08;
const BASE_KEY_TAG: u8 = 0x12;
const IDENTITY_KEY_TAG: u8 = 0x1A;
const MESSAGE_TAG: u8 = 0x22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message too short")]
    Truncated,
    #[error("malformed field encoding")]
    Malformed,
}

fn varint_length(value: u32) -> usize {
    let mut length = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        length += 1;
        rest >>= 7;
    }
    length
}

fn write_varint(output: &mut [u8], pos: usize, mut value: u32) -> usize {
    let mut pos = pos;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            output[pos] = byte;
            return pos + 1;
        }
        output[pos] = byte | 0x80;
        pos += 1;
    }
}

struct FieldReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn done(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn tag(&mut self) -> u8 {
        let tag = self.input[self.pos];
        self.pos += 1;
        tag
    }

    fn varint(&mut self) -> Result<u32, DecodeError> {
        let mut value = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = *self.input.get(self.pos).ok_or(DecodeError::Malformed)?;
            self.pos += 1;
            if shift == 28 && byte & !0x0F != 0 {
                return Err(DecodeError::Malformed);
            }
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 28 {
                return Err(DecodeError::Malformed);
            }
        }
    }

    fn string(&mut self) -> Result<Range<usize>, DecodeError> {
        let length = self.varint()? as usize;
        let start = self.pos;
        let end = start.checked_add(length).ok_or(DecodeError::Malformed)?;
        if end > self.input.len() {
            return Err(DecodeError::Malformed);
        }
        self.pos = end;
        Ok(start..end)
    }

    fn skip_unknown(&mut self, tag: u8) -> Result<(), DecodeError> {
        match tag & 0x07 {
            0 => self.varint().map(|_| ()),
            2 => self.string().map(|_| ()),
            _ => Err(DecodeError::Malformed),
        }
    }
}

/// Borrowed view of a decoded MESSAGE body.
///
/// Fields are optional at this layer; callers decide which are mandatory.
/// The ciphertext is reported as a range so the MAC can be checked over the
/// surrounding bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReader<'a> {
    pub version: u8,
    pub counter: Option<u32>,
    pub ratchet_key: Option<&'a [u8]>,
    pub ciphertext: Option<Range<usize>>,
}

/// Parse a MESSAGE body, leaving the trailing `mac_length` bytes unparsed.
pub fn decode_message(input: &[u8], mac_length: usize) -> Result<MessageReader<'_>, DecodeError> {
    if input.len() < 1 + mac_length {
        return Err(DecodeError::Truncated);
    }
    let framed_end = input.len() - mac_length;
    let mut reader = FieldReader { input: &input[..framed_end], pos: 1 };
    let mut message = MessageReader {
        version: input[0],
        counter: None,
        ratchet_key: None,
        ciphertext: None,
    };

    while !reader.done() {
        match reader.tag() {
            RATCHET_KEY_TAG => {
                let range = reader.string()?;
                message.ratchet_key = Some(&input[range]);
            }
            COUNTER_TAG => message.counter = Some(reader.varint()?),
            CIPHERTEXT_TAG => message.ciphertext = Some(reader.string()?),
            unknown => reader.skip_unknown(unknown)?,
        }
    }
    Ok(message)
}

/// Encoded length of a MESSAGE body, MAC included.
pub fn message_length(
    counter: u32,
    ratchet_key_length: usize,
    ciphertext_length: usize,
    mac_length: usize,
) -> usize {
    1 + 1
        + varint_length(ratchet_key_length as u32)
        + ratchet_key_length
        + 1
        + varint_length(counter)
        + 1
        + varint_length(ciphertext_length as u32)
        + ciphertext_length
        + mac_length
}

/// Lay out a MESSAGE header in `output` and return the region the
/// ciphertext must be written into. `output` must be sized with
/// [`message_length`]; the trailing MAC region is left untouched.
pub fn encode_message(
    version: u8,
    counter: u32,
    ratchet_key: &[u8],
    ciphertext_length: usize,
    output: &mut [u8],
) -> Range<usize> {
    output[0] = version;
    output[1] = RATCHET_KEY_TAG;
    let mut pos = write_varint(output, 2, ratchet_key.len() as u32);
    output[pos..pos + ratchet_key.len()].copy_from_slice(ratchet_key);
    pos += ratchet_key.len();
    output[pos] = COUNTER_TAG;
    pos = write_varint(output, pos + 1, counter);
    output[pos] = CIPHERTEXT_TAG;
    pos = write_varint(output, pos + 1, ciphertext_length as u32);
    pos..pos + ciphertext_length
}

/// Borrowed view of a decoded PRE_KEY_MESSAGE envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessageReader<'a> {
    pub version: u8,
    pub one_time_key_id: Option<u32>,
    pub base_key: Option<&'a [u8]>,
    pub identity_key: Option<&'a [u8]>,
    pub message: Option<&'a [u8]>,
}

/// Parse a PRE_KEY_MESSAGE envelope. The version byte is recorded but not
/// judged here; the inner message's MAC is the authentication boundary.
pub fn decode_one_time_key_message(input: &[u8]) -> Result<PreKeyMessageReader<'_>, DecodeError> {
    if input.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let mut reader = FieldReader { input, pos: 1 };
    let mut message = PreKeyMessageReader {
        version: input[0],
        one_time_key_id: None,
        base_key: None,
        identity_key: None,
        message: None,
    };

    while !reader.done() {
        match reader.tag() {
            ONE_TIME_KEY_ID_TAG => message.one_time_key_id = Some(reader.varint()?),
            BASE_KEY_TAG => {
                let range = reader.string()?;
                message.base_key = Some(&input[range]);
            }
            IDENTITY_KEY_TAG => {
                let range = reader.string()?;
                message.identity_key = Some(&input[range]);
            }
            MESSAGE_TAG => {
                let range = reader.string()?;
                message.message = Some(&input[range]);
            }
            unknown => reader.skip_unknown(unknown)?,
        }
    }
    Ok(message)
}

/// Encoded length of a PRE_KEY_MESSAGE envelope.
pub fn one_time_key_message_length(
    one_time_key_id: u32,
    base_key_length: usize,
    identity_key_length: usize,
    message_length: usize,
) -> usize {
    1 + 1
        + varint_length(one_time_key_id)
        + 1
        + varint_length(base_key_length as u32)
        + base_key_length
        + 1
        + varint_length(identity_key_length as u32)
        + identity_key_length
        + 1
        + varint_length(message_length as u32)
        + message_length
}

/// Lay out a PRE_KEY_MESSAGE envelope in `output` and return the region the
/// inner MESSAGE body must be written into. `output` must be sized with
/// [`one_time_key_message_length`].
pub fn encode_one_time_key_message(
    version: u8,
    one_time_key_id: u32,
    base_key: &[u8],
    identity_key: &[u8],
    message_length: usize,
    output: &mut [u8],
) -> Range<usize> {
    output[0] = version;
    output[1] = ONE_TIME_KEY_ID_TAG;
    let mut pos = write_varint(output, 2, one_time_key_id);
    output[pos] = BASE_KEY_TAG;
    pos = write_varint(output, pos + 1, base_key.len() as u32);
    output[pos..pos + base_key.len()].copy_from_slice(base_key);
    pos += base_key.len();
    output[pos] = IDENTITY_KEY_TAG;
    pos = write_varint(output, pos + 1, identity_key.len() as u32);
    output[pos..pos + identity_key.len()].copy_from_slice(identity_key);
    pos += identity_key.len();
    output[pos] = MESSAGE_TAG;
    pos = write_varint(output, pos + 1, message_length as u32);
    pos..pos + message_length
}
