//! Action wire codec.
//!
//! Frame layout: an 8-byte header (body length as LE u32, then crc32c of
//! the body as LE u32) followed by the body: a verb tag byte and
//! length-prefixed (LE u16) operand strings. The alphabet is closed; every
//! verb encodes a fixed operand count.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

/// Largest frame the codec will decode.
pub const MAX_ACTION_FRAME: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown verb tag {tag}")]
    UnknownVerb { tag: u8 },

    #[error("truncated frame: need {need} more bytes")]
    Truncated { need: usize },

    #[error("bad operand: {reason}")]
    BadOperand { reason: String },

    #[error("frame length {got} exceeds {max}")]
    FrameTooLarge { max: usize, got: usize },

    #[error("frame crc mismatch: expected {expected} got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

/// One atomic graph mutation applied at a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "kebab-case")]
pub enum Action {
    AddApp {
        name: String,
        kind: String,
        arg: String,
    },
    RemoveApp {
        name: String,
    },
    ReconfigApp {
        name: String,
        arg: String,
    },
    Link {
        from: String,
        to: String,
    },
    Unlink {
        from: String,
        to: String,
    },
}

const TAG_ADD_APP: u8 = 1;
const TAG_REMOVE_APP: u8 = 2;
const TAG_RECONFIG_APP: u8 = 3;
const TAG_LINK: u8 = 4;
const TAG_UNLINK: u8 = 5;

impl Action {
    pub fn verb(&self) -> &'static str {
        match self {
            Action::AddApp { .. } => "add-app",
            Action::RemoveApp { .. } => "remove-app",
            Action::ReconfigApp { .. } => "reconfig-app",
            Action::Link { .. } => "link",
            Action::Unlink { .. } => "unlink",
        }
    }
}

/// Encode an action into a complete frame.
pub fn encode(action: &Action) -> Vec<u8> {
    let mut body = BytesMut::new();
    match action {
        Action::AddApp { name, kind, arg } => {
            body.put_u8(TAG_ADD_APP);
            put_operand(&mut body, name);
            put_operand(&mut body, kind);
            put_operand(&mut body, arg);
        }
        Action::RemoveApp { name } => {
            body.put_u8(TAG_REMOVE_APP);
            put_operand(&mut body, name);
        }
        Action::ReconfigApp { name, arg } => {
            body.put_u8(TAG_RECONFIG_APP);
            put_operand(&mut body, name);
            put_operand(&mut body, arg);
        }
        Action::Link { from, to } => {
            body.put_u8(TAG_LINK);
            put_operand(&mut body, from);
            put_operand(&mut body, to);
        }
        Action::Unlink { from, to } => {
            body.put_u8(TAG_UNLINK);
            put_operand(&mut body, from);
            put_operand(&mut body, to);
        }
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn put_operand(body: &mut BytesMut, operand: &str) {
    debug_assert!(operand.len() <= u16::MAX as usize, "oversized operand");
    body.put_u16_le(operand.len() as u16);
    body.put_slice(operand.as_bytes());
}

/// Decode one complete frame back into an action.
pub fn decode(frame: &[u8]) -> Result<Action, CodecError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Truncated {
            need: FRAME_HEADER_LEN - frame.len(),
        });
    }
    let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if length > MAX_ACTION_FRAME {
        return Err(CodecError::FrameTooLarge {
            max: MAX_ACTION_FRAME,
            got: length,
        });
    }
    let expected_crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() < length {
        return Err(CodecError::Truncated {
            need: length - body.len(),
        });
    }
    let body = &body[..length];
    let actual_crc = crc32c::crc32c(body);
    if actual_crc != expected_crc {
        return Err(CodecError::ChecksumMismatch {
            expected: expected_crc,
            got: actual_crc,
        });
    }

    let mut cursor = body;
    if !cursor.has_remaining() {
        return Err(CodecError::Truncated { need: 1 });
    }
    let tag = cursor.get_u8();
    let action = match tag {
        TAG_ADD_APP => Action::AddApp {
            name: get_operand(&mut cursor)?,
            kind: get_operand(&mut cursor)?,
            arg: get_operand(&mut cursor)?,
        },
        TAG_REMOVE_APP => Action::RemoveApp {
            name: get_operand(&mut cursor)?,
        },
        TAG_RECONFIG_APP => Action::ReconfigApp {
            name: get_operand(&mut cursor)?,
            arg: get_operand(&mut cursor)?,
        },
        TAG_LINK => Action::Link {
            from: get_operand(&mut cursor)?,
            to: get_operand(&mut cursor)?,
        },
        TAG_UNLINK => Action::Unlink {
            from: get_operand(&mut cursor)?,
            to: get_operand(&mut cursor)?,
        },
        tag => return Err(CodecError::UnknownVerb { tag }),
    };
    if cursor.has_remaining() {
        return Err(CodecError::BadOperand {
            reason: format!("{} trailing bytes after operands", cursor.remaining()),
        });
    }
    Ok(action)
}

fn get_operand(cursor: &mut &[u8]) -> Result<String, CodecError> {
    if cursor.remaining() < 2 {
        return Err(CodecError::Truncated {
            need: 2 - cursor.remaining(),
        });
    }
    let len = cursor.get_u16_le() as usize;
    if cursor.remaining() < len {
        return Err(CodecError::Truncated {
            need: len - cursor.remaining(),
        });
    }
    let bytes = cursor.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadOperand {
        reason: "operand is not utf-8".to_string(),
    })
}
