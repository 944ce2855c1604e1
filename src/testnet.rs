//! Fixed three-node test network: one block-producing node hosting the
//! delegate identities, and two peer nodes (`alice`, `bob`).
//!
//! The producer starts first and listens on a per-run peer-to-peer port;
//! the peers connect to it. First-time bootstrap imports the delegate and
//! funding keys and snapshots each wallet; later runs restore the snapshots
//! instead, which is materially cheaper.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::error::{HarnessError, Result};
use crate::genesis;
use crate::node::{Node, NodeOptions};

/// Working directory holding per-node data dirs and wallet snapshots. Kept
/// across runs so quick bootstrap can find the snapshots.
pub const HARNESS_DIR: &str = "tmp";

pub const DEFAULT_WALLET: &str = "default";
pub const DEFAULT_PASSWORD: &str = "password";
/// Effectively "never relock" for the lifetime of a test run.
pub const UNLOCK_SECONDS: u64 = 9_999_999;

const DELEGATE_HTTP_PORT: u16 = 5690;
const DELEGATE_RPC_PORT: u16 = 6690;
const ALICE_HTTP_PORT: u16 = 5691;
const ALICE_RPC_PORT: u16 = 6691;
const BOB_HTTP_PORT: u16 = 5692;
const BOB_RPC_PORT: u16 = 6692;

pub struct TestNet {
    harness_dir: PathBuf,
    genesis: PathBuf,
    p2p_port: u16,
    delegate: Option<Node>,
    alice: Option<Node>,
    bob: Option<Node>,
    running: bool,
}

impl TestNet {
    /// A network rooted at the conventional `tmp` directory with
    /// `genesis.json` from the current directory.
    pub fn new() -> Result<Self> {
        Self::with_dirs(PathBuf::from(HARNESS_DIR), PathBuf::from("genesis.json"))
    }

    pub fn with_dirs(harness_dir: PathBuf, genesis: PathBuf) -> Result<Self> {
        let p2p_port = portpicker::pick_unused_port()
            .ok_or_else(|| HarnessError::Bootstrap("no free p2p port".to_string()))?;
        Ok(TestNet {
            harness_dir,
            genesis,
            p2p_port,
            delegate: None,
            alice: None,
            bob: None,
            running: false,
        })
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    /// The block-producing node. Panics if it failed to start or was shut
    /// down; test scenarios have no meaningful way to continue without it.
    pub fn delegate_node(&mut self) -> &mut Node {
        self.delegate.as_mut().expect("delegate node is not in the active set")
    }

    pub fn alice_node(&mut self) -> &mut Node {
        self.alice.as_mut().expect("alice node is not in the active set")
    }

    pub fn bob_node(&mut self) -> &mut Node {
        self.bob.as_mut().expect("bob node is not in the active set")
    }

    /// Resolves the client binary from `LEDGER_BUILD`, trying the testnet
    /// build first.
    fn client_binary(&self) -> Result<PathBuf> {
        let build = std::env::var("LEDGER_BUILD").unwrap_or_else(|_| "../..".to_string());
        let candidates = [
            Path::new(&build).join("programs/client/ledger_testnet_client"),
            Path::new(&build).join("programs/client/ledger_client"),
        ];
        for candidate in &candidates {
            if candidate.exists() {
                return Ok(candidate.clone());
            }
        }
        Err(HarnessError::Bootstrap(format!(
            "{} not found, please set LEDGER_BUILD env variable if you are using out of source builds",
            candidates[0].display()
        )))
    }

    fn node_dir(&self, name: &str) -> PathBuf {
        self.harness_dir.join(name)
    }

    /// Where a node's wallet snapshot lives, keyed by node name.
    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.harness_dir.join(format!("{name}_wallet_backup.json"))
    }

    /// Quick bootstrap is possible once a previous run captured the
    /// delegate wallet snapshot.
    pub fn quick_bootstrap_available(&self) -> bool {
        self.snapshot_path("delegate").exists()
    }

    fn node_options(&self, name: &str, http_port: u16, rpc_port: u16, producer: bool) -> NodeOptions {
        NodeOptions {
            name: name.to_string(),
            data_dir: self.node_dir(name),
            genesis: self.genesis.clone(),
            http_port,
            rpc_port,
            p2p_port: self.p2p_port,
            producer,
        }
    }

    /// Starts the producer first (it listens for peer connections), then
    /// the peers, and waits for readiness with a partial-failure policy:
    /// a node that fails to start is logged and dropped from the active
    /// set, it does not abort the run.
    fn launch_nodes(&mut self) -> Result<()> {
        let binary = self.client_binary()?;

        let mut delegate = Node::new(
            binary.clone(),
            self.node_options("delegate", DELEGATE_HTTP_PORT, DELEGATE_RPC_PORT, true),
        );
        delegate.start(false)?;
        self.delegate = Some(delegate);

        let mut alice = Node::new(
            binary.clone(),
            self.node_options("alice", ALICE_HTTP_PORT, ALICE_RPC_PORT, false),
        );
        alice.start(false)?;
        self.alice = Some(alice);

        let mut bob = Node::new(
            binary,
            self.node_options("bob", BOB_HTTP_PORT, BOB_RPC_PORT, false),
        );
        bob.start(false)?;
        self.bob = Some(bob);

        for slot in [&mut self.delegate, &mut self.alice, &mut self.bob] {
            let ready = match slot.as_mut() {
                Some(node) => match node.wait_for_ready() {
                    Ok(()) => true,
                    Err(e) => {
                        error!("{e}");
                        false
                    }
                },
                None => false,
            };
            if !ready {
                // Dropping the handle kills any half-started process.
                *slot = None;
            }
        }
        Ok(())
    }

    /// Stands the network up from fresh per-node directories, then
    /// bootstraps wallets: quick restore when snapshots exist, otherwise
    /// the full key-import path.
    pub fn create(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.harness_dir)?;
        for name in ["delegate", "alice", "bob"] {
            let dir = self.node_dir(name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            std::fs::create_dir(&dir)?;
        }

        let quick = self.quick_bootstrap_available();
        self.launch_nodes()?;

        if quick {
            self.quick_bootstrap()?;
        } else {
            for node in [&mut self.alice, &mut self.bob].into_iter().flatten() {
                node.wallet().create(DEFAULT_WALLET, DEFAULT_PASSWORD)?;
                node.wallet().unlock(UNLOCK_SECONDS, DEFAULT_PASSWORD)?;
            }
            self.full_bootstrap()?;
        }

        self.running = true;
        Ok(())
    }

    /// Re-launches against existing node state: opens and unlocks the
    /// wallets created by an earlier `create` instead of bootstrapping.
    pub fn start(&mut self) -> Result<()> {
        self.launch_nodes()?;

        {
            let node = self.delegate_node();
            node.wallet().open(DEFAULT_WALLET)?;
            node.wallet().unlock(UNLOCK_SECONDS, DEFAULT_PASSWORD)?;
            node.wallet().delegate_set_block_production("ALL", true)?;
        }
        for node in [&mut self.alice, &mut self.bob].into_iter().flatten() {
            node.wallet().open(DEFAULT_WALLET)?;
            node.wallet().unlock(UNLOCK_SECONDS, DEFAULT_PASSWORD)?;
        }

        self.running = true;
        Ok(())
    }

    /// First-time setup: imports the 101 delegate keys into the producer,
    /// funding keys everywhere, enables block production, and snapshots
    /// every wallet for quick bootstrap next time. Imports on this scale
    /// take minutes; that cost is exactly what the snapshots amortize.
    fn full_bootstrap(&mut self) -> Result<()> {
        println!("first time test net bootstrap.. this may take several minutes, please be patient..");
        info!("========== full bootstrap ===========");

        for name in ["delegate", "alice", "bob"] {
            let snapshot = self.snapshot_path(name);
            if snapshot.exists() {
                std::fs::remove_file(&snapshot)?;
            }
        }

        let keypairs = genesis::parse_keypair_manifest(&genesis::keypair_manifest_path(
            &self.genesis,
        ))?;
        let balance_keys = genesis::parse_balance_manifest(&genesis::balance_manifest_path(
            &self.genesis,
        ))?;
        if balance_keys.len() < 4 {
            return Err(HarnessError::Bootstrap(format!(
                "need at least 4 funding keys, manifest has {}",
                balance_keys.len()
            )));
        }

        let delegate_snapshot = self.snapshot_path("delegate");
        {
            let node = self.delegate_node();
            node.wallet().create(DEFAULT_WALLET, DEFAULT_PASSWORD)?;
            node.wallet().unlock(UNLOCK_SECONDS, DEFAULT_PASSWORD)?;
            for (i, pair) in keypairs.iter().enumerate() {
                node.wallet()
                    .import_private_key(&pair.private, &format!("delegate{i}"))?;
            }
            std::thread::sleep(std::time::Duration::from_secs(1));

            node.wallet()
                .import_private_key_and_rescan(&balance_keys[0].private, "account0")?;
            node.wallet()
                .import_private_key_and_rescan(&balance_keys[1].private, "account1")?;
            node.wallet().delegate_set_block_production("ALL", true)?;
            node.wallet().backup_create(&delegate_snapshot)?;
        }

        let alice_snapshot = self.snapshot_path("alice");
        {
            let node = self.alice_node();
            node.wallet()
                .import_private_key_and_rescan(&balance_keys[2].private, "angel")?;
            node.wallet().backup_create(&alice_snapshot)?;
        }

        let bob_snapshot = self.snapshot_path("bob");
        {
            let node = self.bob_node();
            node.wallet()
                .import_private_key_and_rescan(&balance_keys[3].private, "angel")?;
            node.wallet().backup_create(&bob_snapshot)?;
        }

        Ok(())
    }

    /// Restores each node's wallet from its snapshot with the fixed default
    /// password. Idempotent: restoring the same snapshots yields the same
    /// wallet state every time.
    fn quick_bootstrap(&mut self) -> Result<()> {
        info!("========== quick bootstrap ===========");
        for name in ["delegate", "alice", "bob"] {
            let snapshot = self.snapshot_path(name);
            let node = match name {
                "delegate" => self.delegate_node(),
                "alice" => self.alice_node(),
                _ => self.bob_node(),
            };
            node.wallet()
                .backup_restore(&snapshot, DEFAULT_WALLET, DEFAULT_PASSWORD)?;
        }
        Ok(())
    }

    /// Invokes `f` once per delegate identity, `delegate0` through
    /// `delegate100`. Scenarios use this to act identically across every
    /// block producer, e.g. broadcasting a price feed from each.
    pub fn for_each_delegate<F: FnMut(&str)>(&self, mut f: F) {
        for i in 0..genesis::DELEGATE_COUNT {
            f(&format!("delegate{i}"));
        }
    }

    /// Stops every node, ignoring individual stop failures, and marks the
    /// network not-running.
    pub fn shutdown(&mut self) {
        info!("shutdown");
        for slot in [&mut self.delegate, &mut self.alice, &mut self.bob] {
            if let Some(node) = slot.as_mut() {
                if let Err(e) = node.stop() {
                    warn!("failed to stop node '{}': {e}", node.name());
                }
            }
        }
        self.running = false;
    }

    /// Debug aid: prints the node URLs and offers per-node interactive
    /// consoles until any other input arrives.
    pub fn pause(&mut self) -> Result<()> {
        // Raw console output on the peers makes their command results
        // readable in the interactive session.
        self.alice_node().control().execute_command_line("enable_raw")?;
        self.bob_node().control().execute_command_line("enable_raw")?;
        loop {
            println!("@pause: use the following urls to access the nodes via browser:");
            println!("- delegate node: {}", self.delegate_node().url());
            println!("- alice node: {}", self.alice_node().url());
            println!("- bob node: {}", self.bob_node().url());
            println!("or enter [d], [a], or [b] for console access");
            println!("or anything else to shutdown testnet and continue..");
            let mut choice = String::new();
            std::io::stdin().lock().read_line(&mut choice)?;
            match choice.trim() {
                "d" => self.delegate_node().interactive_mode()?,
                "a" => self.alice_node().interactive_mode()?,
                "b" => self.bob_node().interactive_mode()?,
                _ => break,
            }
        }
        Ok(())
    }
}
