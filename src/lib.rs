#![forbid(unsafe_code)]
//! Acceptance-test harness for a multi-node distributed ledger client.
//!
//! The harness spawns several independent node processes, drives them over
//! the client's JSON-RPC interface, waits for consensus progress (new
//! blocks), and records asynchronous webhook callbacks for later assertion.
//! The client binary itself is opaque: it is controlled only through its
//! command-line flags, its stdout lines, and RPC calls.
//!
//! Test scenarios build on [`testnet::TestNet`], which owns a fixed
//! three-node topology (one block producer, two peers), and on the typed
//! RPC namespaces reachable through each [`node::Node`].

use std::io::{Error, ErrorKind};
use std::path::Path;

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};

pub mod api;
pub mod error;
pub mod genesis;
pub mod node;
pub mod poll;
pub mod rpc;
pub mod testnet;
pub mod webhook;

pub use error::{HarnessError, Result};

pub const DEFAULT_LOGFILE_NAME: &str = "harness.log";

/// Routes the `log` facade to a rolling file under `log_dir`, so node
/// output and per-call RPC logging survive the run. Call once per process,
/// before creating a network.
pub fn initialize_logging(log_dir: &Path) -> std::io::Result<()> {
    let window_size = 3; // log0, log1, log2
    let fixed_window_roller = FixedWindowRoller::builder()
        .build("harness-log{}", window_size)
        .map_err(|e| Error::new(ErrorKind::Other, e))?;
    let size_limit = 5 * 1024 * 1024; // 5MB as max log file size to roll
    let size_trigger = SizeTrigger::new(size_limit);
    let compound_policy =
        CompoundPolicy::new(Box::new(size_trigger), Box::new(fixed_window_roller));

    let config = Config::builder()
        .appender(
            Appender::builder().build(
                "logfile",
                Box::new(
                    RollingFileAppender::builder()
                        .encoder(Box::new(PatternEncoder::new("{d} {l}::{m}{n}")))
                        .build(log_dir.join(DEFAULT_LOGFILE_NAME), Box::new(compound_policy))?,
                ),
            ),
        )
        .build(
            Root::builder()
                .appender("logfile")
                .build(LevelFilter::Debug),
        )
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

    log4rs::init_config(config).map_err(|e| Error::new(ErrorKind::Other, e))?;
    Ok(())
}
