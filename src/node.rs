//! One spawned ledger-client process and its command channel.
//!
//! A `Node` owns the child process, the line stream read from its captured
//! output, and, once the process announces readiness, exactly one
//! [`RpcClient`] bound to its HTTP port. The RPC client must never be used
//! before the readiness marker has been observed.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use json::{array, JsonValue};
use log::{debug, error, info, warn};

use crate::api::{ChainApi, ControlApi, WalletApi};
use crate::error::{HarnessError, Result};
use crate::poll::{poll, BLOCK_POLL_INTERVAL};
use crate::rpc::RpcClient;

/// The stdout line that signals the RPC server is accepting connections,
/// followed by the HTTP port number.
pub const READY_MARKER: &str = "Starting HTTP JSON RPC server on port";

pub const RPC_USERNAME: &str = "user";
pub const RPC_PASSWORD: &str = "pass";

/// Bound on waiting for the readiness marker before startup fails.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound on the graceful `quit` before the child is hard-killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Structured launch options; [`Node::command_args`] turns these into the
/// client binary's flag surface.
#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub name: String,
    pub data_dir: PathBuf,
    pub genesis: PathBuf,
    pub http_port: u16,
    pub rpc_port: u16,
    /// Shared per-run peer-to-peer port. The producer listens on it; peers
    /// connect to it.
    pub p2p_port: u16,
    /// Whether this node hosts the block-producing identities.
    pub producer: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Unstarted,
    Starting,
    /// Readiness observed, RPC client attached.
    Running,
    Stopped,
    /// Terminal: an RPC transport failure coincided with confirmed process
    /// death.
    Crashed,
}

pub struct Node {
    client_binary: PathBuf,
    options: NodeOptions,
    state: NodeState,
    child: Option<Child>,
    output_lines: Option<Receiver<String>>,
    rpc: Option<RpcClient>,
}

impl Node {
    pub fn new(client_binary: PathBuf, options: NodeOptions) -> Self {
        Node {
            client_binary,
            options,
            state: NodeState::Unstarted,
            child: None,
            output_lines: None,
            rpc: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn running(&self) -> bool {
        self.rpc.is_some()
    }

    /// Base URL of the node's HTTP interface, for browsers and debugging.
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.options.http_port)
    }

    /// The full flag surface passed to the spawned client binary.
    pub fn command_args(&self) -> Vec<String> {
        let o = &self.options;
        let mut args = vec![
            format!("--data-dir={}", o.data_dir.display()),
            format!("--genesis-config={}", o.genesis.display()),
            "--min-delegate-connection-count=0".to_string(),
            "--statistics-enabled".to_string(),
            "--server".to_string(),
            format!("--rpcuser={RPC_USERNAME}"),
            format!("--rpcpassword={RPC_PASSWORD}"),
            format!("--httpport={}", o.http_port),
            format!("--rpcport={}", o.rpc_port),
            "--upnp=false".to_string(),
        ];
        if o.producer {
            args.push(format!("--p2p-port={}", o.p2p_port));
        } else {
            args.push(format!("--connect-to=127.0.0.1:{}", o.p2p_port));
        }
        args.push("--disable-default-peers".to_string());
        args
    }

    /// Spawns the process with stdin/stdout/stderr captured. With
    /// `wait_for_ready` set, also blocks until the readiness marker appears
    /// (or startup fails).
    pub fn start(&mut self, wait_for_ready: bool) -> Result<()> {
        info!(
            "starting node '{}', http port: {}, rpc port: {}, p2p port: {}",
            self.options.name, self.options.http_port, self.options.rpc_port, self.options.p2p_port
        );
        let mut child = Command::new(&self.client_binary)
            .args(self.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HarnessError::Startup {
                node: self.options.name.clone(),
                reason: format!("failed to spawn {}: {e}", self.client_binary.display()),
            })?;

        // Both output streams feed one unbounded line channel; when the child
        // exits and both drain, the channel disconnects, which is how EOF is
        // observed. The channel must never drop lines: the readiness marker
        // can sit behind an arbitrary amount of boot output, and readiness
        // for peer nodes is only consumed after the producer's wait finishes.
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        for stream in [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn std::io::Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn std::io::Read + Send>),
        ]
        .into_iter()
        .flatten()
        {
            let tx = tx.clone();
            let name = self.options.name.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
                    debug!("[{name}] {line}");
                    let _ = tx.send(line);
                }
            });
        }
        drop(tx);

        self.child = Some(child);
        self.output_lines = Some(rx);
        self.state = NodeState::Starting;

        if wait_for_ready {
            self.wait_for_ready()?;
        }
        Ok(())
    }

    /// Consumes output lines until the readiness marker for this node's HTTP
    /// port appears, then attaches the RPC client. Fails on end-of-stream
    /// with no more output, or when `STARTUP_TIMEOUT` passes.
    pub fn wait_for_ready(&mut self) -> Result<()> {
        let rx = self
            .output_lines
            .clone()
            .ok_or_else(|| HarnessError::Startup {
                node: self.options.name.clone(),
                reason: "process was never spawned".to_string(),
            })?;
        let marker = format!("{READY_MARKER} {}", self.options.http_port);
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(line) if line.contains(&marker) => break,
                Ok(_) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.state = NodeState::Crashed;
                    return Err(HarnessError::Startup {
                        node: self.options.name.clone(),
                        reason: "process exited and doesn't have output queued".to_string(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(HarnessError::Startup {
                        node: self.options.name.clone(),
                        reason: format!("no readiness line within {STARTUP_TIMEOUT:?}"),
                    });
                }
            }
        }
        // Grace period between the marker and the first RPC use; the
        // original harness needed it and so do we.
        std::thread::sleep(Duration::from_secs(1));
        self.rpc = Some(RpcClient::new(
            self.options.http_port,
            RPC_USERNAME,
            RPC_PASSWORD,
            false,
            &self.options.name,
        ));
        self.state = NodeState::Running;
        info!("node '{}' is up", self.options.name);
        Ok(())
    }

    /// Forwards one RPC call. A transport failure is treated as a likely
    /// crash: the child is reaped, and confirmed death becomes
    /// [`HarnessError::ProcessCrashed`]; otherwise the original transport
    /// error is re-raised.
    pub fn exec(&mut self, method: &str, params: JsonValue) -> Result<JsonValue> {
        let rpc = self.rpc.as_ref().ok_or_else(|| HarnessError::NotStarted {
            node: self.options.name.clone(),
        })?;
        match rpc.request(method, params) {
            Err(HarnessError::Transport { method, source }) => {
                error!(
                    "[{}] transport failure during '{}', instance may have crashed: {}",
                    self.options.name, method, source
                );
                if let Some(pid) = self.reap_if_dead() {
                    self.state = NodeState::Crashed;
                    self.rpc = None;
                    return Err(HarnessError::ProcessCrashed {
                        node: self.options.name.clone(),
                        pid,
                    });
                }
                Err(HarnessError::Transport { method, source })
            }
            other => other,
        }
    }

    /// Returns the pid if the child has exited (waiting briefly for a dying
    /// process to be reapable), `None` if it is still running.
    fn reap_if_dead(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        let pid = child.id();
        for _ in 0..10 {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("process {pid} exited with {status}");
                    return Some(pid);
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(_) => return None,
            }
        }
        None
    }

    /// Graceful shutdown: writes a `quit` line to the child's stdin and
    /// waits for exit, hard-killing after `STOP_TIMEOUT`. Clears the RPC
    /// client either way.
    pub fn stop(&mut self) -> Result<()> {
        self.rpc = None;
        let Some(mut child) = self.child.take() else {
            self.state = NodeState::Stopped;
            return Ok(());
        };
        if let Some(mut stdin) = child.stdin.take() {
            let _ = writeln!(stdin, "quit");
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    info!("node '{}' exited with {}", self.options.name, status);
                    break;
                }
                None if Instant::now() >= deadline => {
                    warn!(
                        "node '{}' did not exit within {:?} after quit, killing",
                        self.options.name, STOP_TIMEOUT
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
                None => std::thread::sleep(Duration::from_millis(100)),
            }
        }
        self.state = NodeState::Stopped;
        Ok(())
    }

    /// Head block number from the node's `info` call.
    pub fn head_block_num(&mut self) -> Result<u64> {
        let info = self.exec("info", JsonValue::Null)?;
        info["blockchain_head_block_num"]
            .as_u64()
            .ok_or_else(|| HarnessError::Malformed {
                context: "info".to_string(),
                detail: "missing blockchain_head_block_num".to_string(),
            })
    }

    /// Blocks until the chain height strictly increases, polling once per
    /// second, forever. Transient RPC errors propagate rather than ending
    /// the wait early. Returns the new height.
    pub fn wait_new_block(&mut self) -> Result<u64> {
        self.wait_new_block_bounded(BLOCK_POLL_INTERVAL, None)
    }

    /// Same as [`Node::wait_new_block`] but with an explicit interval and
    /// optional bound.
    pub fn wait_new_block_bounded(
        &mut self,
        interval: Duration,
        max_wait: Option<Duration>,
    ) -> Result<u64> {
        let initial = self.head_block_num()?;
        poll(interval, max_wait, "new block", || {
            let current = self.head_block_num()?;
            Ok((current > initial).then_some(current))
        })
    }

    pub fn wallet(&mut self) -> WalletApi<'_> {
        WalletApi::new(self)
    }

    pub fn chain(&mut self) -> ChainApi<'_> {
        ChainApi::new(self)
    }

    pub fn control(&mut self) -> ControlApi<'_> {
        ControlApi::new(self)
    }

    /// Reads the node's on-disk `config.json`.
    pub fn get_config(&self) -> Result<JsonValue> {
        let path = self.options.data_dir.join("config.json");
        let raw = std::fs::read_to_string(&path)?;
        json::parse(&raw).map_err(|e| HarnessError::Malformed {
            context: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Writes the node's on-disk `config.json` (pretty-printed, as the
    /// client itself does).
    pub fn save_config(&self, config: &JsonValue) -> Result<()> {
        let path = self.options.data_dir.join("config.json");
        std::fs::write(path, config.pretty(2))?;
        Ok(())
    }

    /// Manual debugging console: relays raw command lines to the node's
    /// `execute_command_line` RPC and prints results. `ignore_errors` and
    /// `echo_off` are forced on for the session and restored afterwards.
    pub fn interactive_mode(&mut self) -> Result<()> {
        println!(
            "\nentering node '{}' interactive mode, enter 'exit' or 'quit' to exit",
            self.options.name
        );
        let saved = {
            let rpc = self.rpc.as_mut().ok_or_else(|| HarnessError::NotStarted {
                node: self.options.name.clone(),
            })?;
            let saved = (rpc.ignore_errors, rpc.echo_off);
            rpc.ignore_errors = true;
            rpc.echo_off = true;
            saved
        };

        let mut editor = rustyline::DefaultEditor::new()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        loop {
            let line = match editor.readline("→ ") {
                Ok(line) => line,
                Err(rustyline::error::ReadlineError::Interrupted)
                | Err(rustyline::error::ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("readline error: {e}");
                    break;
                }
            };
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if command == "exit" || command == "quit" {
                break;
            }
            let _ = editor.add_history_entry(command);
            match self.exec("execute_command_line", array![command]) {
                Ok(result) => {
                    if let Some(text) = result.as_str() {
                        if !text.is_empty() {
                            println!("{}", text.replace("\\n", "\n"));
                        }
                    } else if !result.is_null() {
                        println!("{}", result.pretty(2));
                    }
                }
                Err(e) => {
                    eprintln!("{e}");
                    break;
                }
            }
        }

        if let Some(rpc) = self.rpc.as_mut() {
            rpc.ignore_errors = saved.0;
            rpc.echo_off = saved.1;
        }
        Ok(())
    }

    /// A node already serving RPC on `port`, with no owned process. Used to
    /// exercise exec/polling against a mock server.
    #[cfg(test)]
    pub(crate) fn connected_for_tests(port: u16) -> Node {
        let mut node = Node::new(
            PathBuf::from("/nonexistent/ledger_client"),
            NodeOptions {
                name: "mock".to_string(),
                data_dir: PathBuf::from("/tmp"),
                genesis: PathBuf::from("genesis.json"),
                http_port: port,
                rpc_port: port,
                p2p_port: port,
                producer: false,
            },
        );
        node.rpc = Some(RpcClient::new(
            port,
            RPC_USERNAME,
            RPC_PASSWORD,
            false,
            "mock",
        ));
        node.state = NodeState::Running;
        node
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Never leak a node process past the harness.
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tests::{info_responses, mock_rpc_server};
    use std::os::unix::fs::PermissionsExt;
    use tempdir::TempDir;

    fn options(name: &str, producer: bool) -> NodeOptions {
        NodeOptions {
            name: name.to_string(),
            data_dir: PathBuf::from("tmp/delegate"),
            genesis: PathBuf::from("genesis.json"),
            http_port: 5690,
            rpc_port: 6690,
            p2p_port: 17777,
            producer,
        }
    }

    /// Writes an executable stub standing in for the client binary.
    fn stub_binary(dir: &TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("stub_client");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn producer_listens_and_peers_connect() {
        let producer = Node::new(PathBuf::from("client"), options("delegate", true));
        let args = producer.command_args();
        assert!(args.contains(&"--p2p-port=17777".to_string()));
        assert!(args.contains(&"--server".to_string()));
        assert!(args.contains(&"--disable-default-peers".to_string()));
        assert!(args.contains(&"--httpport=5690".to_string()));

        let peer = Node::new(PathBuf::from("client"), options("alice", false));
        let args = peer.command_args();
        assert!(args.contains(&"--connect-to=127.0.0.1:17777".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--p2p-port")));
    }

    #[test]
    fn start_waits_for_readiness_marker() {
        let dir = TempDir::new("node_ready").unwrap();
        let binary = stub_binary(
            &dir,
            "echo 'loading chain database'\n\
             echo 'Starting HTTP JSON RPC server on port 5690'\n\
             while read line; do [ \"$line\" = quit ] && exit 0; done",
        );
        let mut node = Node::new(binary, options("stub", true));
        node.start(true).unwrap();
        assert_eq!(node.state(), NodeState::Running);
        assert!(node.running());
        node.stop().unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(!node.running());
    }

    #[test]
    fn readiness_survives_heavy_boot_output() {
        let dir = TempDir::new("node_noisy").unwrap();
        let binary = stub_binary(
            &dir,
            "i=0\n\
             while [ $i -lt 1100 ]; do echo \"boot chatter line $i\"; i=$((i+1)); done\n\
             echo 'Starting HTTP JSON RPC server on port 5690'\n\
             while read line; do [ \"$line\" = quit ] && exit 0; done",
        );
        let mut node = Node::new(binary, options("noisy", true));
        node.start(false).unwrap();
        // The whole boot transcript queues before anyone reads it, as when
        // another node's readiness is being waited on first.
        std::thread::sleep(Duration::from_secs(3));
        node.wait_for_ready().unwrap();
        assert_eq!(node.state(), NodeState::Running);
        node.stop().unwrap();
    }

    #[test]
    fn eof_without_marker_is_a_startup_failure() {
        let dir = TempDir::new("node_eof").unwrap();
        let binary = stub_binary(&dir, "echo 'failed to open database'; exit 1");
        let mut node = Node::new(binary, options("stub", true));
        let err = node.start(true).unwrap_err();
        match err {
            HarnessError::Startup { node, reason } => {
                assert_eq!(node, "stub");
                assert!(reason.contains("exited"), "{reason}");
            }
            other => panic!("expected Startup, got {other}"),
        }
    }

    #[test]
    fn exec_without_rpc_instance_is_not_started() {
        let mut node = Node::new(PathBuf::from("client"), options("cold", false));
        let err = node.exec("info", JsonValue::Null).unwrap_err();
        assert!(matches!(err, HarnessError::NotStarted { .. }));
    }

    #[test]
    fn transport_failure_with_dead_process_is_a_crash() {
        let dir = TempDir::new("node_crash").unwrap();
        // Announces readiness, then exits immediately: by the time exec runs
        // there is nothing listening and the process is gone.
        let free_port = portpicker::pick_unused_port().unwrap();
        let mut opts = options("flaky", true);
        opts.http_port = free_port;
        let binary = stub_binary(
            &dir,
            &format!("echo 'Starting HTTP JSON RPC server on port {free_port}'"),
        );
        let mut node = Node::new(binary, opts);
        node.start(true).unwrap();
        let err = node.exec("info", JsonValue::Null).unwrap_err();
        match err {
            HarnessError::ProcessCrashed { node: name, .. } => assert_eq!(name, "flaky"),
            other => panic!("expected ProcessCrashed, got {other}"),
        }
        assert_eq!(node.state(), NodeState::Crashed);
    }

    #[test]
    fn transport_failure_without_confirmed_death_reraises() {
        // Nothing listens on this port, and the node owns no child process:
        // the crash branch cannot confirm death and must re-raise the
        // original transport error.
        let port = portpicker::pick_unused_port().unwrap();
        let mut node = Node::connected_for_tests(port);
        let err = node.exec("info", JsonValue::Null).unwrap_err();
        assert!(matches!(err, HarnessError::Transport { .. }));
        assert_eq!(node.state(), NodeState::Running);
    }

    #[test]
    fn wait_new_block_returns_on_strict_increase() {
        let (port, captured, handle) = mock_rpc_server(info_responses(&[10, 10, 10, 11]));
        let mut node = Node::connected_for_tests(port);
        let height = node
            .wait_new_block_bounded(Duration::from_millis(10), Some(Duration::from_secs(5)))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(height, 11);
        // One initial read plus three polls.
        assert_eq!(captured.lock().unwrap().len(), 4);
    }

    #[test]
    fn wait_new_block_propagates_rpc_errors() {
        let responses = vec![
            json::object! { result: { blockchain_head_block_num: 10 } }.dump(),
            json::object! { error: { message: "database corrupted" } }.dump(),
        ];
        let (port, _captured, handle) = mock_rpc_server(responses);
        let mut node = Node::connected_for_tests(port);
        let err = node
            .wait_new_block_bounded(Duration::from_millis(10), Some(Duration::from_secs(5)))
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, HarnessError::Rpc { .. }));
    }
}
