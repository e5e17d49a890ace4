// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire-format types for the hook/pod-manager protocol.
//!
//! Requests and responses travel in fixed-length little-endian frames so that
//! the reader side can issue exact-size reads without any streaming parser.
//! Every request carries the client name and an opaque `req_id` that is echoed
//! back unchanged in the matching response.
//!
//! Request frame layout (zero-padded to [`REQ_MSG_LEN`]):
//!
//! ```text
//! code: u32 | req_id: u64 | name_len: u32 | name bytes | payload
//! ```
//!
//! Response frame layout (zero-padded to [`RSP_MSG_LEN`]):
//!
//! ```text
//! code: u32 | req_id: u64 | payload
//! ```

use bytes::{Buf, BufMut};

/// Fixed size of every request frame, in bytes.
pub const REQ_MSG_LEN: usize = 128;

/// Fixed size of every response frame, in bytes.
pub const RSP_MSG_LEN: usize = 32;

/// Longest accepted client name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

const CODE_QUOTA: u32 = 1;
const CODE_MEM_LIMIT: u32 = 2;
const CODE_MEM_UPDATE: u32 = 3;

/// Header ahead of the client name: code + req_id + name_len.
const REQ_HEADER_LEN: usize = 4 + 8 + 4;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("client name exceeds {MAX_NAME_LEN} bytes")]
    NameTooLong,

    #[error("client name is not valid UTF-8")]
    BadName,

    #[error("unknown request code {0}")]
    UnknownRequestCode(u32),

    #[error("unknown response code {0}")]
    UnknownResponseCode(u32),
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub client: String,
    pub req_id: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestBody {
    /// Ask for the next quota token. `overuse_ms` reports how far past (or
    /// short of, when negative) the previous grant the client actually ran;
    /// `burst_ms` is its latest kernel-burst estimate.
    Quota { overuse_ms: f64, burst_ms: f64 },
    /// Query the memory ledger.
    MemLimit,
    /// Propose a memory allocation (`is_allocate`) or free.
    MemUpdate { bytes: u64, is_allocate: bool },
}

impl RequestBody {
    fn code(&self) -> u32 {
        match self {
            RequestBody::Quota { .. } => CODE_QUOTA,
            RequestBody::MemLimit => CODE_MEM_LIMIT,
            RequestBody::MemUpdate { .. } => CODE_MEM_UPDATE,
        }
    }
}

/// A response body; the frame code mirrors the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    Quota { quota_ms: f64 },
    MemLimit { used: u64, limit: u64 },
    MemUpdate { verdict: bool },
}

impl Response {
    fn code(&self) -> u32 {
        match self {
            Response::Quota { .. } => CODE_QUOTA,
            Response::MemLimit { .. } => CODE_MEM_LIMIT,
            Response::MemUpdate { .. } => CODE_MEM_UPDATE,
        }
    }
}

pub fn encode_request(
    client: &str,
    req_id: u64,
    body: &RequestBody,
) -> Result<[u8; REQ_MSG_LEN], WireError> {
    if client.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong);
    }
    let mut frame = [0u8; REQ_MSG_LEN];
    let mut cur = &mut frame[..];
    cur.put_u32_le(body.code());
    cur.put_u64_le(req_id);
    cur.put_u32_le(client.len() as u32);
    cur.put_slice(client.as_bytes());
    match body {
        RequestBody::Quota {
            overuse_ms,
            burst_ms,
        } => {
            cur.put_f64_le(*overuse_ms);
            cur.put_f64_le(*burst_ms);
        }
        RequestBody::MemLimit => {}
        RequestBody::MemUpdate { bytes, is_allocate } => {
            cur.put_u64_le(*bytes);
            cur.put_i32_le(i32::from(*is_allocate));
        }
    }
    Ok(frame)
}

pub fn parse_request(frame: &[u8]) -> Result<Request, WireError> {
    if frame.len() < REQ_MSG_LEN {
        return Err(WireError::Truncated {
            expected: REQ_MSG_LEN,
            got: frame.len(),
        });
    }
    let mut buf = &frame[..REQ_MSG_LEN];
    let code = buf.get_u32_le();
    let req_id = buf.get_u64_le();
    let name_len = buf.get_u32_le() as usize;
    if name_len > MAX_NAME_LEN {
        return Err(WireError::NameTooLong);
    }
    let client = std::str::from_utf8(&buf[..name_len])
        .map_err(|_| WireError::BadName)?
        .to_string();
    buf.advance(name_len);

    let body = match code {
        CODE_QUOTA => {
            ensure_payload(buf.remaining(), 16, name_len)?;
            RequestBody::Quota {
                overuse_ms: buf.get_f64_le(),
                burst_ms: buf.get_f64_le(),
            }
        }
        CODE_MEM_LIMIT => RequestBody::MemLimit,
        CODE_MEM_UPDATE => {
            ensure_payload(buf.remaining(), 12, name_len)?;
            RequestBody::MemUpdate {
                bytes: buf.get_u64_le(),
                is_allocate: buf.get_i32_le() != 0,
            }
        }
        other => return Err(WireError::UnknownRequestCode(other)),
    };

    Ok(Request {
        client,
        req_id,
        body,
    })
}

fn ensure_payload(remaining: usize, needed: usize, name_len: usize) -> Result<(), WireError> {
    if remaining < needed {
        return Err(WireError::Truncated {
            expected: REQ_HEADER_LEN + name_len + needed,
            got: REQ_HEADER_LEN + name_len + remaining,
        });
    }
    Ok(())
}

pub fn encode_response(req_id: u64, body: &Response) -> [u8; RSP_MSG_LEN] {
    let mut frame = [0u8; RSP_MSG_LEN];
    let mut cur = &mut frame[..];
    cur.put_u32_le(body.code());
    cur.put_u64_le(req_id);
    match body {
        Response::Quota { quota_ms } => cur.put_f64_le(*quota_ms),
        Response::MemLimit { used, limit } => {
            cur.put_u64_le(*used);
            cur.put_u64_le(*limit);
        }
        Response::MemUpdate { verdict } => cur.put_i32_le(i32::from(*verdict)),
    }
    frame
}

pub fn parse_response(frame: &[u8]) -> Result<(u64, Response), WireError> {
    if frame.len() < RSP_MSG_LEN {
        return Err(WireError::Truncated {
            expected: RSP_MSG_LEN,
            got: frame.len(),
        });
    }
    let mut buf = &frame[..RSP_MSG_LEN];
    let code = buf.get_u32_le();
    let req_id = buf.get_u64_le();
    let body = match code {
        CODE_QUOTA => Response::Quota {
            quota_ms: buf.get_f64_le(),
        },
        CODE_MEM_LIMIT => Response::MemLimit {
            used: buf.get_u64_le(),
            limit: buf.get_u64_le(),
        },
        CODE_MEM_UPDATE => Response::MemUpdate {
            verdict: buf.get_i32_le() != 0,
        },
        other => return Err(WireError::UnknownResponseCode(other)),
    };
    Ok((req_id, body))
}
