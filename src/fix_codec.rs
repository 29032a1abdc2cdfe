// ===============================
// src/fix_codec.rs
// ===============================
//
// Minimal tag=value FIX codec.
//
//   8=FIX.4.4 | 9=<body len> | <body fields> | 10=<checksum> |
//
// BodyLength (9) and CheckSum (10) are always recomputed on encode; a message
// parsed from the wire keeps every other field in arrival order, so encoding
// it again reproduces the received bytes for well-formed input.
//
use chrono::Utc;

use crate::fix_session::FixError;

pub const SOH: u8 = 0x01;
pub const BEGIN_STRING: &str = "FIX.4.4";
/// Largest BodyLength accepted; anything above is a protocol error.
pub const MAX_BODY_LEN: usize = 1 << 20;

pub mod tag {
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECKSUM: u32 = 10;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDER_SUB_ID: u32 = 50;
    pub const SENDING_TIME: u32 = 52;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TARGET_SUB_ID: u32 = 57;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const NO_RELATED_SYM: u32 = 146;
    pub const MD_REQ_ID: u32 = 262;
    pub const SUBSCRIPTION_REQUEST_TYPE: u32 = 263;
    pub const MARKET_DEPTH: u32 = 264;
    pub const MD_UPDATE_TYPE: u32 = 265;
    pub const NO_MD_ENTRY_TYPES: u32 = 267;
    pub const NO_MD_ENTRIES: u32 = 268;
    pub const MD_ENTRY_TYPE: u32 = 269;
    pub const MD_ENTRY_PX: u32 = 270;
    pub const MD_ENTRY_SIZE: u32 = 271;
    pub const MD_UPDATE_ACTION: u32 = 279;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
}

pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
    pub const MARKET_DATA_REQUEST: &str = "V";
    pub const MARKET_DATA_SNAPSHOT: &str = "W";
    pub const MARKET_DATA_INCREMENTAL: &str = "X";
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixMessage {
    begin_string: String,
    fields: Vec<(u32, Vec<u8>)>,
}

impl FixMessage {
    pub fn new() -> Self {
        Self { begin_string: BEGIN_STRING.to_string(), fields: Vec::new() }
    }

    pub fn append_pair(&mut self, tag: u32, value: impl ToString) -> &mut Self {
        self.fields.push((tag, value.to_string().into_bytes()));
        self
    }

    pub fn append_bytes(&mut self, tag: u32, value: &[u8]) -> &mut Self {
        self.fields.push((tag, value.to_vec()));
        self
    }

    pub fn begin_string(&self) -> &str { &self.begin_string }

    pub fn get(&self, tag: u32) -> Option<&[u8]> { self.get_nth(tag, 0) }

    /// `n`-th occurrence of `tag` (repeating groups).
    pub fn get_nth(&self, tag: u32, n: usize) -> Option<&[u8]> {
        self.fields.iter().filter(|(t, _)| *t == tag).nth(n).map(|(_, v)| v.as_slice())
    }

    pub fn get_str(&self, tag: u32) -> Option<&str> {
        self.get(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_nth_str(&self, tag: u32, n: usize) -> Option<&str> {
        self.get_nth(tag, n).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn msg_type(&self) -> Option<&str> { self.get_str(tag::MSG_TYPE) }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.fields.len() * 12);
        for (t, v) in &self.fields {
            body.extend_from_slice(t.to_string().as_bytes());
            body.push(b'=');
            body.extend_from_slice(v);
            body.push(SOH);
        }

        let mut out = Vec::with_capacity(body.len() + 32);
        out.extend_from_slice(format!("8={}", self.begin_string).as_bytes());
        out.push(SOH);
        out.extend_from_slice(format!("9={}", body.len()).as_bytes());
        out.push(SOH);
        out.extend_from_slice(&body);
        let sum = checksum(&out);
        out.extend_from_slice(format!("10={sum:03}").as_bytes());
        out.push(SOH);
        out
    }
}

impl std::fmt::Display for FixMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let printable: String = self.encode().iter().map(|&b| if b == SOH { '|' } else { b as char }).collect();
        f.write_str(&printable)
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u32, |acc, b| acc + *b as u32) as u8
}

pub fn utc_timestamp() -> String {
    Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

fn field_at(buf: &[u8], pos: usize) -> Result<Option<(u32, &[u8], usize)>, FixError> {
    let rest = &buf[pos..];
    let Some(end) = rest.iter().position(|b| *b == SOH) else { return Ok(None) };
    let raw = &rest[..end];
    let eq = raw
        .iter()
        .position(|b| *b == b'=')
        .ok_or_else(|| FixError::Protocol(format!("field without '=' at byte {pos}")))?;
    let tag = std::str::from_utf8(&raw[..eq])
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| FixError::Protocol(format!("bad tag at byte {pos}")))?;
    Ok(Some((tag, &raw[eq + 1..], pos + end + 1)))
}

/// Parse one message from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; the buffer is not touched either way.
pub fn parse(buf: &[u8]) -> Result<Option<FixMessage>, FixError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() >= 2 && !buf.starts_with(b"8=") {
        return Err(FixError::Protocol("message does not start with 8=".into()));
    }

    let Some((t, begin, pos)) = field_at(buf, 0)? else { return Ok(None) };
    if t != tag::BEGIN_STRING {
        return Err(FixError::Protocol("missing BeginString".into()));
    }
    let Some((t, len_raw, body_start)) = field_at(buf, pos)? else { return Ok(None) };
    if t != tag::BODY_LENGTH {
        return Err(FixError::Protocol("BodyLength must follow BeginString".into()));
    }
    let body_len = std::str::from_utf8(len_raw)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| FixError::Protocol("bad BodyLength".into()))?;

    if body_len > MAX_BODY_LEN {
        return Err(FixError::Protocol(format!("BodyLength {body_len} over {MAX_BODY_LEN}")));
    }
    let body_end = body_start
        .checked_add(body_len)
        .ok_or_else(|| FixError::Protocol("bad BodyLength".into()))?;
    if buf.len() < body_end {
        return Ok(None);
    }
    let Some((t, sum_raw, _end)) = field_at(buf, body_end)? else { return Ok(None) };
    if t != tag::CHECKSUM {
        return Err(FixError::Protocol("CheckSum not found after body".into()));
    }
    let expected = checksum(&buf[..body_end]);
    let got = std::str::from_utf8(sum_raw).ok().and_then(|s| s.parse::<u32>().ok());
    if got != Some(expected as u32) {
        return Err(FixError::Protocol(format!("checksum mismatch: got {got:?}, expected {expected}")));
    }

    let mut msg = FixMessage {
        begin_string: String::from_utf8_lossy(begin).into_owned(),
        fields: Vec::new(),
    };
    let mut pos = body_start;
    while pos < body_end {
        match field_at(&buf[..body_end], pos)? {
            Some((t, v, next)) => {
                msg.append_bytes(t, v);
                pos = next;
            }
            None => return Err(FixError::Protocol("truncated field inside body".into())),
        }
    }
    Ok(Some(msg))
}
