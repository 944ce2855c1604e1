//! Error taxonomy for the harness.
//!
//! `TransportParse` and `Rpc` are the two kinds an [`crate::rpc::RpcClient`]
//! may swallow when `ignore_errors` is set; everything else always propagates.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The node process exited, or produced no readiness line within the
    /// bounded startup wait.
    #[error("node '{node}' failed to start: {reason}")]
    Startup { node: String, reason: String },

    /// The RPC response body was not valid JSON.
    #[error("cannot parse json '{body}' returned from server in response of '{method} {params}'")]
    TransportParse {
        method: String,
        params: String,
        body: String,
    },

    /// A well-formed RPC response carrying an `error` field.
    #[error("rpc error in response of '{method} {params}': {error}")]
    Rpc {
        method: String,
        params: String,
        error: String,
    },

    /// An RPC transport failure that coincided with confirmed process death.
    #[error("node '{node}' (pid:{pid}) crashed or exited unexpectedly")]
    ProcessCrashed { node: String, pid: u32 },

    /// The raw HTTP/connection failure. A connection reset here is the
    /// trigger for crash detection in [`crate::node::Node::exec`].
    #[error("transport failure during '{method}': {source}")]
    Transport {
        method: String,
        source: reqwest::Error,
    },

    /// Missing key manifests or snapshot files. Fatal to the run.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Well-formed transport, unusable content (missing field, bad config
    /// file, bad genesis document).
    #[error("malformed data in {context}: {detail}")]
    Malformed { context: String, detail: String },

    /// A bounded poll gave up.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { waited: Duration, what: String },

    /// `exec` was called before the node reached readiness.
    #[error("node '{node}' has no rpc instance, make sure the node is started")]
    NotStarted { node: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
