//! Wire format: one JSON-RPC object per line.
//!
//! Requests carry `id`, `method`, `params`; notifications are requests with a
//! `null` id; responses carry `id`, `result`, `error`. Parsing of the params
//! arrays is manual rather than through serde tuple structs so that errors
//! name the offending field.

use crate::error::ProtocolError;
use crate::target::Difficulty;
use crate::types::{Extranonce, Job, ShareCandidate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const SET_EXTRANONCE: &str = "mining.set_extranonce";
    pub const RECONNECT: &str = "client.reconnect";
    pub const SHOW_MESSAGE: &str = "client.show_message";
}

/// JSON-RPC message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request, or notification when `id` is `None`.
    Request {
        id: Option<u64>,
        method: String,
        #[serde(default)]
        params: Value,
    },

    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    /// Parse one line received from the pool.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError::MalformedMessage(format!("{}: {}", e, truncate(line, 120))))
    }

    /// Serialize with the terminating newline.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

pub fn subscribe_request(id: u64, client_name: &str) -> JsonRpcMessage {
    JsonRpcMessage::request(id, methods::SUBSCRIBE, json!([client_name]))
}

pub fn authorize_request(id: u64, username: &str, password: &str) -> JsonRpcMessage {
    JsonRpcMessage::request(id, methods::AUTHORIZE, json!([username, password]))
}

/// `[username, job_id, extranonce2_hex, ntime_hex, nonce_hex]`
pub fn submit_request(id: u64, username: &str, share: &ShareCandidate) -> JsonRpcMessage {
    JsonRpcMessage::request(
        id,
        methods::SUBMIT,
        json!([
            username,
            share.job_id,
            hex::encode(&share.extranonce2),
            hex::encode(&share.ntime),
            format!("{:08x}", share.nonce),
        ]),
    )
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedMessage(msg.into())
}

fn params_array<'a>(params: &'a Value, method: &str) -> Result<&'a Vec<Value>, ProtocolError> {
    params
        .as_array()
        .ok_or_else(|| malformed(format!("{} params not an array", method)))
}

fn hex_field(value: &Value, name: &str) -> Result<Vec<u8>, ProtocolError> {
    let s = value.as_str().ok_or_else(|| malformed(format!("{} not a string", name)))?;
    hex::decode(s).map_err(|e| malformed(format!("{} hex: {}", name, e)))
}

/// Subscribe result: `[[subscriptions...], extranonce1_hex, extranonce2_size]`.
pub fn parse_subscribe_result(result: &Value) -> Result<Extranonce, ProtocolError> {
    let arr = result
        .as_array()
        .ok_or_else(|| malformed("subscribe result not an array"))?;
    if arr.len() < 3 {
        return Err(malformed(format!("subscribe result has {} fields, expected 3", arr.len())));
    }
    let extranonce1 = hex_field(&arr[1], "extranonce1")?;
    let extranonce2_size = arr[2]
        .as_u64()
        .ok_or_else(|| malformed("extranonce2_size not a number"))? as usize;
    if extranonce2_size == 0 || extranonce2_size > 16 {
        return Err(malformed(format!("extranonce2_size {} out of range", extranonce2_size)));
    }
    Ok(Extranonce {
        extranonce1,
        extranonce2_size,
    })
}

/// `mining.notify`:
/// `[job_id, prevhash, coinb1, coinb2, merkle_branch[], version, nbits, ntime, clean_jobs]`.
pub fn parse_notify(params: &Value) -> Result<Job, ProtocolError> {
    let arr = params_array(params, methods::NOTIFY)?;
    if arr.len() < 9 {
        return Err(malformed(format!("mining.notify has {} params, expected 9", arr.len())));
    }

    let job_id = arr[0].as_str().ok_or_else(|| malformed("job_id not a string"))?.to_string();
    let previous_block_hash = hex_field(&arr[1], "prevhash")?;
    let coinbase_part1 = hex_field(&arr[2], "coinb1")?;
    let coinbase_part2 = hex_field(&arr[3], "coinb2")?;

    let branches = arr[4].as_array().ok_or_else(|| malformed("merkle_branch not an array"))?;
    let merkle_branches = branches
        .iter()
        .map(|b| hex_field(b, "merkle branch"))
        .collect::<Result<Vec<_>, _>>()?;

    let version = hex_field(&arr[5], "version")?;
    let bits = hex_field(&arr[6], "nbits")?;
    let time = hex_field(&arr[7], "ntime")?;
    let clean_jobs = arr[8].as_bool().ok_or_else(|| malformed("clean_jobs not a bool"))?;

    Ok(Job {
        job_id,
        previous_block_hash,
        coinbase_part1,
        coinbase_part2,
        merkle_branches,
        version,
        bits,
        time,
        clean_jobs,
    })
}

/// `mining.set_difficulty`: `[difficulty]`. Non-positive values are
/// `InvalidDifficulty`, anything that is not a number is malformed.
pub fn parse_set_difficulty(params: &Value) -> Result<Difficulty, ProtocolError> {
    let arr = params_array(params, methods::SET_DIFFICULTY)?;
    let value = arr
        .first()
        .ok_or_else(|| malformed("set_difficulty params empty"))?
        .as_f64()
        .ok_or_else(|| malformed("difficulty not a number"))?;
    Difficulty::new(value)
}

/// `mining.set_extranonce`: `[extranonce1_hex, extranonce2_size]`.
pub fn parse_set_extranonce(params: &Value) -> Result<Extranonce, ProtocolError> {
    let arr = params_array(params, methods::SET_EXTRANONCE)?;
    if arr.len() < 2 {
        return Err(malformed("set_extranonce params too short"));
    }
    parse_subscribe_result(&json!([Value::Null, arr[0], arr[1]]))
}

/// Pool verdict on a submitted share or an authorize request.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: Option<String>,
}

/// `result: true` is acceptance; `false`, `null` or any `error` is rejection.
/// Errors are `[code, message, ...]` on most pools.
pub fn parse_verdict(result: Option<&Value>, error: Option<&Value>) -> Verdict {
    if let Some(err) = error.filter(|e| !e.is_null()) {
        let reason = match err {
            Value::Array(parts) => parts
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Verdict {
            accepted: false,
            reason: Some(reason),
        };
    }
    match result.and_then(Value::as_bool) {
        Some(true) => Verdict {
            accepted: true,
            reason: None,
        },
        _ => Verdict {
            accepted: false,
            reason: Some("pool returned false".to_string()),
        },
    }
}
