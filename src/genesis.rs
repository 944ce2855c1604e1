//! Deterministic chain seed: the genesis document and its key manifests.
//!
//! The genesis JSON lists named delegate identities (public key and pay
//! rate) and `[address, balance]` pairs. Alongside it live two line-oriented
//! manifests consumed during full bootstrap: `<genesis>.keypairs` with
//! `<public> <private>` per delegate, and `<genesis>.balancekeys` with
//! `<address> <private>` per funding identity. Key material itself comes
//! from the ledger's external key utility; the harness never derives keys.

use std::path::{Path, PathBuf};
use std::process::Command;

use json::{array, object, JsonValue};
use log::info;

use crate::error::{HarnessError, Result};

/// Delegates are numbered 0 through 100 inclusive.
pub const DELEGATE_COUNT: usize = 101;
/// Funding balances split the remainder four ways.
pub const FUNDING_ACCOUNTS: u64 = 4;

pub const DELEGATE_PAY_RATE: &str = "100";
pub const TOTAL_BALANCE: u64 = 20_000_000_000_000;
pub const DELEGATE_BALANCE: u64 = 10_000_000_000;

/// One key as emitted by the key utility: signing pair plus the derived
/// balance address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyTriple {
    pub public: String,
    pub private: String,
    pub address: String,
}

/// One `<public> <private>` manifest line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub public: String,
    pub private: String,
}

/// One `<address> <private>` manifest line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceKey {
    pub address: String,
    pub private: String,
}

pub fn keypair_manifest_path(genesis: &Path) -> PathBuf {
    PathBuf::from(format!("{}.keypairs", genesis.display()))
}

pub fn balance_manifest_path(genesis: &Path) -> PathBuf {
    PathBuf::from(format!("{}.balancekeys", genesis.display()))
}

pub fn parse_keypair_manifest(path: &Path) -> Result<Vec<KeyPair>> {
    let raw = read_manifest(path)?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(public), Some(private)) => Ok(KeyPair {
                    public: public.to_string(),
                    private: private.to_string(),
                }),
                _ => Err(HarnessError::Bootstrap(format!(
                    "bad key-pair line '{line}' in {}",
                    path.display()
                ))),
            }
        })
        .collect()
}

pub fn parse_balance_manifest(path: &Path) -> Result<Vec<BalanceKey>> {
    let raw = read_manifest(path)?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(address), Some(private)) => Ok(BalanceKey {
                    address: address.to_string(),
                    private: private.to_string(),
                }),
                _ => Err(HarnessError::Bootstrap(format!(
                    "bad balance-key line '{line}' in {}",
                    path.display()
                ))),
            }
        })
        .collect()
}

fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        HarnessError::Bootstrap(format!("cannot read manifest {}: {e}", path.display()))
    })
}

/// Runs the external key utility once and parses its three key lines.
pub fn create_key(key_binary: &Path) -> Result<KeyTriple> {
    let output = Command::new(key_binary).output().map_err(|e| {
        HarnessError::Bootstrap(format!(
            "cannot run key utility {}: {e}",
            key_binary.display()
        ))
    })?;
    let text = String::from_utf8_lossy(&output.stdout).to_string();
    parse_key_output(&text).ok_or_else(|| HarnessError::Malformed {
        context: key_binary.display().to_string(),
        detail: format!("unexpected key utility output: '{text}'"),
    })
}

/// The utility prints labeled lines; the key values sit after `: ` on lines
/// 0 (public), 2 (private) and 4 (address).
fn parse_key_output(text: &str) -> Option<KeyTriple> {
    let lines: Vec<&str> = text.lines().collect();
    let field = |idx: usize| -> Option<String> {
        lines
            .get(idx)?
            .split(": ")
            .nth(1)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    Some(KeyTriple {
        public: field(0)?,
        private: field(2)?,
        address: field(4)?,
    })
}

/// Builds a test genesis from a base document: 101 delegate identities with
/// a fixed balance each, the remainder split across four funding balances.
/// Writes the genesis and both manifests next to `genesis_out`.
pub fn generate(base: &Path, genesis_out: &Path, key_binary: &Path) -> Result<()> {
    let mut delegate_keys = Vec::with_capacity(DELEGATE_COUNT);
    for _ in 0..DELEGATE_COUNT {
        delegate_keys.push(create_key(key_binary)?);
    }
    let mut balance_keys = Vec::with_capacity(FUNDING_ACCOUNTS as usize);
    for _ in 0..FUNDING_ACCOUNTS {
        balance_keys.push(create_key(key_binary)?);
    }

    let raw = std::fs::read_to_string(base)?;
    let mut genesis = json::parse(&raw).map_err(|e| HarnessError::Malformed {
        context: base.display().to_string(),
        detail: e.to_string(),
    })?;
    fill_genesis(&mut genesis, &delegate_keys, &balance_keys);

    std::fs::write(genesis_out, genesis.pretty(2))?;
    write_keypair_manifest(&keypair_manifest_path(genesis_out), &delegate_keys)?;
    write_balance_manifest(&balance_manifest_path(genesis_out), &balance_keys)?;
    info!("generated {}", genesis_out.display());
    Ok(())
}

pub(crate) fn fill_genesis(
    genesis: &mut JsonValue,
    delegate_keys: &[KeyTriple],
    balance_keys: &[KeyTriple],
) {
    genesis["names"] = JsonValue::new_array();
    genesis["balances"] = JsonValue::new_array();
    let mut remaining = TOTAL_BALANCE;
    for (i, key) in delegate_keys.iter().enumerate() {
        genesis["names"]
            .push(object! {
                name: format!("delegate{i}"),
                delegate_pay_rate: DELEGATE_PAY_RATE,
                owner: key.public.clone(),
            })
            .expect("names is an array");
        genesis["balances"]
            .push(array![key.address.clone(), DELEGATE_BALANCE])
            .expect("balances is an array");
        remaining -= DELEGATE_BALANCE;
    }
    for key in balance_keys {
        genesis["balances"]
            .push(array![key.address.clone(), remaining / FUNDING_ACCOUNTS])
            .expect("balances is an array");
    }
}

pub fn write_keypair_manifest(path: &Path, keys: &[KeyTriple]) -> Result<()> {
    let mut out = String::new();
    for key in keys {
        out.push_str(&format!("{}   {}\n", key.public, key.private));
    }
    std::fs::write(path, out)?;
    Ok(())
}

pub fn write_balance_manifest(path: &Path, keys: &[KeyTriple]) -> Result<()> {
    let mut out = String::new();
    for key in keys {
        out.push_str(&format!("{} {}\n", key.address, key.private));
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn triple(n: usize) -> KeyTriple {
        KeyTriple {
            public: format!("PUB{n}"),
            private: format!("PRIV{n}"),
            address: format!("ADDR{n}"),
        }
    }

    #[test]
    fn keypair_manifest_round_trips() {
        let dir = TempDir::new("manifests").unwrap();
        let path = dir.path().join("genesis.json.keypairs");
        let keys: Vec<KeyTriple> = (0..3).map(triple).collect();
        write_keypair_manifest(&path, &keys).unwrap();
        let parsed = parse_keypair_manifest(&path).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].public, "PUB1");
        assert_eq!(parsed[1].private, "PRIV1");
    }

    #[test]
    fn balance_manifest_round_trips() {
        let dir = TempDir::new("manifests").unwrap();
        let path = dir.path().join("genesis.json.balancekeys");
        let keys: Vec<KeyTriple> = (0..4).map(triple).collect();
        write_balance_manifest(&path, &keys).unwrap();
        let parsed = parse_balance_manifest(&path).unwrap();
        assert_eq!(parsed[2].address, "ADDR2");
        assert_eq!(parsed[2].private, "PRIV2");
    }

    #[test]
    fn missing_manifest_is_a_bootstrap_failure() {
        let err = parse_keypair_manifest(Path::new("/nonexistent/genesis.json.keypairs"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Bootstrap(_)));
    }

    #[test]
    fn genesis_balances_sum_to_the_total() {
        let delegate_keys: Vec<KeyTriple> = (0..DELEGATE_COUNT).map(triple).collect();
        let balance_keys: Vec<KeyTriple> = (1000..1000 + FUNDING_ACCOUNTS as usize)
            .map(triple)
            .collect();
        let mut genesis = json::object! { chain_id: "test", names: [], balances: [] };
        fill_genesis(&mut genesis, &delegate_keys, &balance_keys);

        assert_eq!(genesis["names"].len(), DELEGATE_COUNT);
        assert_eq!(
            genesis["balances"].len(),
            DELEGATE_COUNT + FUNDING_ACCOUNTS as usize
        );
        assert_eq!(genesis["names"][0]["name"], "delegate0");
        assert_eq!(genesis["names"][100]["name"], "delegate100");
        let sum: u64 = genesis["balances"]
            .members()
            .map(|pair| pair[1].as_u64().unwrap())
            .sum();
        assert_eq!(sum, TOTAL_BALANCE);
        // Untouched base fields survive.
        assert_eq!(genesis["chain_id"], "test");
    }

    #[test]
    fn key_utility_output_parses_labeled_lines() {
        let text = "public key: PUBKEY123\n\
                    hex: deadbeef\n\
                    private key: PRIVKEY456\n\
                    hex: cafebabe\n\
                    address: ADDR789\n";
        let key = parse_key_output(text).unwrap();
        assert_eq!(key.public, "PUBKEY123");
        assert_eq!(key.private, "PRIVKEY456");
        assert_eq!(key.address, "ADDR789");
    }
}
