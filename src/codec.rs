//! Pure byte-level FIX 4.4 codec.
//!
//! Every message begins with BeginString and BodyLength, in that order. The
//! BodyLength value counts the bytes following the BodyLength field's own
//! trailing SOH, up to and including the SOH preceding the CheckSum field.
//! The CheckSum value is the sum of every prior byte (including the SOH
//! preceding the CheckSum field) modulo 256, as three zero-padded digits.
//!
//! Nothing in this module does I/O or keeps state beyond the dictionaries
//! passed in; the session layer owns timing and sequencing.

use std::collections::HashMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::dictionary::Dictionary;
use crate::error::{FixlineError, Result};

/// FIX field separator, ASCII control-A.
pub const SOH: u8 = 0x01;

/// First two framing fields of every outbound message, up to the BodyLength
/// value.
const HEADER_START: &[u8] = b"8=FIX.4.4\x019=";

/// `10=` + three digits + SOH.
const TRAILER_LEN: usize = 7;

/// Reason a candidate inbound message failed frame validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    MalformedHeader,
    MissingChecksum,
    BadInitialTags,
    BadChecksum,
    BadBodyLength,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FrameError::MalformedHeader => "improper header",
            FrameError::MissingChecksum => "no checksum present",
            FrameError::BadInitialTags => "error in first three tags",
            FrameError::BadChecksum => "invalid checksum",
            FrameError::BadBodyLength => "invalid BodyLength",
        };
        f.write_str(text)
    }
}

/// Encodes one `tag=value` field, SOH-terminated, resolving `name` through
/// the tag dictionary.
pub fn encode_field(dict: &Dictionary, name: &str, value: &[u8]) -> Result<Bytes> {
    let tag = dict
        .tag(name)
        .ok_or_else(|| FixlineError::UnknownTag(name.to_string()))?;
    Ok(raw_field(tag, value))
}

/// Current UTC time as `YYYYMMDD-HH:MM:SS.mmm`, ASCII.
pub fn sending_time() -> Bytes {
    Bytes::from(Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string())
}

/// Three-digit zero-padded `(sum of bytes) mod 256`.
pub fn checksum(message: &[u8]) -> [u8; 3] {
    let sum: u32 = message.iter().map(|b| *b as u32).sum();
    let cks = (sum % 256) as u8;
    [b'0' + cks / 100, b'0' + cks / 10 % 10, b'0' + cks % 10]
}

/// Assembles a complete wire message from already-encoded body fields.
///
/// The first field must be the MsgType field (`35=…`). `34=<seq_num>` is
/// injected immediately after it; BeginString, BodyLength, and CheckSum are
/// derived here.
pub fn compile(body_fields: &[Bytes], seq_num: u64) -> Result<Bytes> {
    let Some(first) = body_fields.first() else {
        return Err(FixlineError::Compile("empty field list".into()));
    };
    if !first.starts_with(b"35=") {
        return Err(FixlineError::Compile(
            "first body field must be MsgType (35=)".into(),
        ));
    }
    for field in body_fields {
        if field.last() != Some(&SOH) {
            return Err(FixlineError::Compile(format!(
                "field not SOH-terminated: {:?}",
                field
            )));
        }
    }

    let seq = seq_num.to_string();
    let body_len: usize = body_fields.iter().map(|f| f.len()).sum::<usize>() + 4 + seq.len();

    let mut message = BytesMut::with_capacity(HEADER_START.len() + body_len + 32);
    message.put_slice(HEADER_START);
    message.put_slice(body_len.to_string().as_bytes());
    message.put_u8(SOH);
    message.put_slice(first);
    message.put_slice(b"34=");
    message.put_slice(seq.as_bytes());
    message.put_u8(SOH);
    for field in &body_fields[1..] {
        message.put_slice(field);
    }

    let cks = checksum(&message);
    message.put_slice(b"10=");
    message.put_slice(&cks);
    message.put_u8(SOH);
    Ok(message.freeze())
}

/// True when the message opens with `8=FIX.` (version-agnostic on receive).
pub fn header_is_present(message: &[u8]) -> bool {
    message.len() >= 6 && &message[..6] == b"8=FIX."
}

/// True when the message closes with a `10=DDD` field.
pub fn checksum_is_present(message: &[u8]) -> bool {
    if message.len() < TRAILER_LEN {
        return false;
    }
    let tail = &message[message.len() - TRAILER_LEN..];
    tail.starts_with(b"10=")
        && tail[3..6].iter().all(u8::is_ascii_digit)
        && tail[6] == SOH
}

/// True when the first three fields carry tags 8, 9, and 35, in that order.
pub fn verify_initial_fields(message: &[u8]) -> bool {
    let mut fields = message.split(|b| *b == SOH);
    matches!(
        (fields.next(), fields.next(), fields.next()),
        (Some(f1), Some(f2), Some(f3))
            if f1.starts_with(b"8=") && f2.starts_with(b"9=") && f3.starts_with(b"35=")
    )
}

/// True when the BodyLength value matches the byte count between the
/// BodyLength field's trailing SOH and the CheckSum field.
pub fn verify_body_length(message: &[u8]) -> bool {
    let Some(first_soh) = memchr::memchr(SOH, message) else {
        return false;
    };
    let after_first = first_soh + 1;
    let Some(rel) = memchr::memchr(SOH, &message[after_first..]) else {
        return false;
    };
    let body_start = after_first + rel + 1;
    if message.len() < body_start + TRAILER_LEN {
        return false;
    }
    let Some(claimed) = message[after_first..body_start - 1].strip_prefix(b"9=") else {
        return false;
    };
    match parse_ascii_u64(claimed) {
        Some(n) => n as usize == message.len() - body_start - TRAILER_LEN,
        None => false,
    }
}

/// True when the CheckSum value equals the checksum of everything before the
/// CheckSum field.
pub fn verify_checksum(message: &[u8]) -> bool {
    if !checksum_is_present(message) {
        return false;
    }
    let split = message.len() - TRAILER_LEN;
    let declared = &message[split + 3..split + 6];
    checksum(&message[..split]).as_slice() == declared
}

/// Runs the frame checks an already-reassembled message must pass, in order.
pub fn validate_frame(message: &[u8]) -> std::result::Result<(), FrameError> {
    if !verify_initial_fields(message) {
        return Err(FrameError::BadInitialTags);
    }
    if !verify_checksum(message) {
        return Err(FrameError::BadChecksum);
    }
    if !verify_body_length(message) {
        return Err(FrameError::BadBodyLength);
    }
    Ok(())
}

/// Splits a wire message into a field-name → value map via the reverse tag
/// dictionary.
pub fn decompile(dict: &Dictionary, message: &[u8]) -> Result<HashMap<String, Bytes>> {
    let mut sections: Vec<&[u8]> = message.split(|b| *b == SOH).collect();
    if sections.len() == 1 {
        return Err(FixlineError::MalformedField(
            "no field separators".to_string(),
        ));
    }
    // Bytes past the final SOH; empty when the message is well formed.
    sections.pop();

    let mut fields = HashMap::with_capacity(sections.len());
    for section in sections {
        let Some(eq) = memchr::memchr(b'=', section) else {
            return Err(FixlineError::MalformedField(
                String::from_utf8_lossy(section).into_owned(),
            ));
        };
        let (tag, value) = (&section[..eq], &section[eq + 1..]);
        let name = dict.name(tag).ok_or_else(|| {
            FixlineError::UnknownTagNumber(String::from_utf8_lossy(tag).into_owned())
        })?;
        fields.insert(name.to_string(), Bytes::copy_from_slice(value));
    }
    Ok(fields)
}

fn raw_field(tag: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(tag.len() + value.len() + 2);
    buf.put_slice(tag);
    buf.put_u8(b'=');
    buf.put_slice(value);
    buf.put_u8(SOH);
    buf.freeze()
}

pub(crate) fn parse_ascii_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

// Field-list constructors for the administrative messages the session
// originates. MsgSeqNum is injected later by `compile`.

pub fn logon_fields(
    heart_bt_int: u64,
    reset_seq_num: bool,
    sender_comp_id: &[u8],
    target_comp_id: &[u8],
) -> Vec<Bytes> {
    let mut fields = vec![
        raw_field(b"35", b"A"),
        raw_field(b"49", sender_comp_id),
        raw_field(b"56", target_comp_id),
        raw_field(b"52", &sending_time()),
        raw_field(b"98", b"0"),
        raw_field(b"108", heart_bt_int.to_string().as_bytes()),
    ];
    if reset_seq_num {
        fields.push(raw_field(b"141", b"Y"));
    }
    fields
}

pub fn heartbeat_fields(
    test_req_id: Option<&[u8]>,
    sender_comp_id: &[u8],
    target_comp_id: &[u8],
) -> Vec<Bytes> {
    let mut fields = vec![
        raw_field(b"35", b"0"),
        raw_field(b"49", sender_comp_id),
        raw_field(b"56", target_comp_id),
        raw_field(b"52", &sending_time()),
    ];
    if let Some(id) = test_req_id {
        fields.push(raw_field(b"112", id));
    }
    fields
}

pub fn test_request_fields(
    test_req_id: &[u8],
    sender_comp_id: &[u8],
    target_comp_id: &[u8],
) -> Vec<Bytes> {
    vec![
        raw_field(b"35", b"1"),
        raw_field(b"49", sender_comp_id),
        raw_field(b"56", target_comp_id),
        raw_field(b"52", &sending_time()),
        raw_field(b"112", test_req_id),
    ]
}

pub fn resend_request_fields(
    begin_seq_no: u64,
    end_seq_no: u64,
    sender_comp_id: &[u8],
    target_comp_id: &[u8],
) -> Vec<Bytes> {
    vec![
        raw_field(b"35", b"2"),
        raw_field(b"49", sender_comp_id),
        raw_field(b"56", target_comp_id),
        raw_field(b"52", &sending_time()),
        raw_field(b"7", begin_seq_no.to_string().as_bytes()),
        raw_field(b"16", end_seq_no.to_string().as_bytes()),
    ]
}
