//! JSON-RPC 2.0 request/response cycle over authenticated HTTP.
//!
//! One call per invocation, synchronous and blocking, with no client-side
//! timeout: a hung node call blocks the test. That is a real failure mode of
//! the harness and deliberately not masked here.

use std::sync::atomic::{AtomicU64, Ordering};

use json::JsonValue;
use log::{error, info};

use crate::error::{HarnessError, Result};

/// Every node serves its JSON-RPC endpoint on this path.
pub const RPC_PATH: &str = "/rpc";

pub struct RpcClient {
    url: String,
    username: String,
    password: String,
    agent: reqwest::blocking::Client,
    next_id: AtomicU64,
    instance_name: String,
    /// When set, `TransportParse`/`Rpc` outcomes are logged but swallowed and
    /// the call yields `JsonValue::Null`. Used to probe state without
    /// aborting, e.g. checking whether a wallet is already unlocked.
    pub ignore_errors: bool,
    /// Silences per-call logging without changing error semantics. Used
    /// during bulk key imports and interactive mode to avoid log flooding.
    pub echo_off: bool,
}

impl RpcClient {
    pub fn new(
        port: u16,
        username: &str,
        password: &str,
        ignore_errors: bool,
        instance_name: &str,
    ) -> Self {
        RpcClient {
            url: format!("http://localhost:{port}{RPC_PATH}"),
            username: username.to_string(),
            password: password.to_string(),
            agent: reqwest::blocking::Client::new(),
            next_id: AtomicU64::new(0),
            instance_name: instance_name.to_string(),
            ignore_errors,
            echo_off: false,
        }
    }

    /// Performs one call. `params` may be `Null` (no parameters), a single
    /// value, or an array; fractional numbers are sent as canonical decimal
    /// strings so the wire format never depends on host float formatting.
    pub fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        let params = canonicalize_params(params);
        let display = params_display(&params);
        if !self.echo_off {
            info!("[{}] request: {} {}", self.instance_name, method, display);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json::object! {
            method: method,
            params: params,
            id: id,
        };

        let response = self
            .agent
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.dump())
            .send()
            .and_then(|r| r.text())
            .map_err(|source| HarnessError::Transport {
                method: method.to_string(),
                source,
            })?;

        let mut parsed = match json::parse(&response) {
            Ok(parsed) => parsed,
            Err(_) => {
                error!(
                    "[{}] cannot parse json '{}' returned from server in response of '{} {}'",
                    self.instance_name, response, method, display
                );
                if self.ignore_errors {
                    return Ok(JsonValue::Null);
                }
                return Err(HarnessError::TransportParse {
                    method: method.to_string(),
                    params: display,
                    body: response,
                });
            }
        };

        if !parsed["error"].is_null() {
            error!("[{}] error: {}", self.instance_name, parsed["error"]);
            if !self.ignore_errors {
                return Err(HarnessError::Rpc {
                    method: method.to_string(),
                    params: display,
                    error: parsed["error"].dump(),
                });
            }
            eprintln!("{}", parsed["error"].pretty(2));
        } else if !self.echo_off {
            info!("[{}] ok", self.instance_name);
        }

        Ok(parsed["result"].take())
    }
}

/// Normalizes params to an array, stringifying fractional numbers.
fn canonicalize_params(params: JsonValue) -> JsonValue {
    let members = match params {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => items,
        single => vec![single],
    };
    JsonValue::Array(members.into_iter().map(canonicalize_param).collect())
}

fn canonicalize_param(param: JsonValue) -> JsonValue {
    match param {
        JsonValue::Number(_) if param.as_i64().is_none() && param.as_u64().is_none() => {
            JsonValue::String(param.dump())
        }
        other => other,
    }
}

/// Space-joined params the way the original logged them: bare strings, JSON
/// text for everything else.
fn params_display(params: &JsonValue) -> String {
    params
        .members()
        .map(|p| match p.as_str() {
            Some(s) => s.to_string(),
            None => p.dump(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
