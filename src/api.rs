//! Typed RPC namespaces over a node's client.
//!
//! The original harness forwarded arbitrary method names, prefixed with
//! `wallet_`/`blockchain_`, straight to a process-global RPC singleton. Here
//! each namespace is an explicit borrow of one [`Node`] with one method per
//! supported call, so call sites are checked at compile time and multiple
//! independent networks can coexist in one test process.

use json::{array, JsonValue};

use crate::error::Result;
use crate::node::Node;

/// `wallet_*` calls.
pub struct WalletApi<'a> {
    node: &'a mut Node,
}

impl<'a> WalletApi<'a> {
    pub(crate) fn new(node: &'a mut Node) -> Self {
        WalletApi { node }
    }

    pub fn create(&mut self, wallet: &str, password: &str) -> Result<JsonValue> {
        self.node.exec("wallet_create", array![wallet, password])
    }

    pub fn open(&mut self, wallet: &str) -> Result<JsonValue> {
        self.node.exec("wallet_open", array![wallet])
    }

    /// `seconds` travels as a string; the original always sent `'9999999'`.
    pub fn unlock(&mut self, seconds: u64, password: &str) -> Result<JsonValue> {
        self.node
            .exec("wallet_unlock", array![seconds.to_string(), password])
    }

    pub fn import_private_key(&mut self, key: &str, account: &str) -> Result<JsonValue> {
        self.node
            .exec("wallet_import_private_key", array![key, account])
    }

    /// Import that also creates the named account and rescans the chain for
    /// its balances; used for funding keys carried in the genesis.
    pub fn import_private_key_and_rescan(&mut self, key: &str, account: &str) -> Result<JsonValue> {
        self.node
            .exec("wallet_import_private_key", array![key, account, true, true])
    }

    /// `delegate` may be an identity name or `"ALL"`.
    pub fn delegate_set_block_production(
        &mut self,
        delegate: &str,
        enabled: bool,
    ) -> Result<JsonValue> {
        self.node.exec(
            "wallet_delegate_set_block_production",
            array![delegate, enabled],
        )
    }

    pub fn backup_create(&mut self, path: &std::path::Path) -> Result<JsonValue> {
        self.node
            .exec("wallet_backup_create", array![path.display().to_string()])
    }

    pub fn backup_restore(
        &mut self,
        path: &std::path::Path,
        wallet: &str,
        password: &str,
    ) -> Result<JsonValue> {
        self.node.exec(
            "wallet_backup_restore",
            array![path.display().to_string(), wallet, password],
        )
    }

    pub fn account_create(&mut self, account: &str) -> Result<JsonValue> {
        self.node.exec("wallet_account_create", array![account])
    }

    /// Registers `account` on-chain, with `payer` covering the fee.
    pub fn account_register(&mut self, account: &str, payer: &str) -> Result<JsonValue> {
        self.node
            .exec("wallet_account_register", array![account, payer])
    }

    pub fn transfer(
        &mut self,
        amount: f64,
        symbol: &str,
        from: &str,
        to: &str,
    ) -> Result<JsonValue> {
        self.node
            .exec("wallet_transfer", array![amount, symbol, from, to])
    }

    pub fn account_balance(&mut self, account: &str) -> Result<JsonValue> {
        self.node.exec("wallet_account_balance", array![account])
    }

    pub fn publish_price_feed(
        &mut self,
        delegate: &str,
        price: f64,
        symbol: &str,
    ) -> Result<JsonValue> {
        self.node.exec(
            "wallet_publish_price_feed",
            array![delegate, price, symbol],
        )
    }
}

/// `blockchain_*` calls.
pub struct ChainApi<'a> {
    node: &'a mut Node,
}

impl<'a> ChainApi<'a> {
    pub(crate) fn new(node: &'a mut Node) -> Self {
        ChainApi { node }
    }

    pub fn get_asset(&mut self, symbol: &str) -> Result<JsonValue> {
        self.node.exec("blockchain_get_asset", array![symbol])
    }

    pub fn list_delegates(&mut self, first: u32, count: u32) -> Result<JsonValue> {
        self.node
            .exec("blockchain_list_delegates", array![first, count])
    }
}

/// Un-prefixed control-plane calls.
pub struct ControlApi<'a> {
    node: &'a mut Node,
}

impl<'a> ControlApi<'a> {
    pub(crate) fn new(node: &'a mut Node) -> Self {
        ControlApi { node }
    }

    pub fn info(&mut self) -> Result<JsonValue> {
        self.node.exec("info", JsonValue::Null)
    }

    /// Executes raw command-line text in the node's own console parser.
    pub fn execute_command_line(&mut self, line: &str) -> Result<JsonValue> {
        self.node.exec("execute_command_line", array![line])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::rpc::tests::mock_rpc_server;

    #[test]
    fn wallet_calls_map_to_prefixed_methods() {
        let ok = json::object! { result: true }.dump();
        let (port, captured, handle) = mock_rpc_server(vec![ok.clone(), ok]);
        let mut node = Node::connected_for_tests(port);
        node.wallet().create("default", "password").unwrap();
        node.wallet().unlock(9_999_999, "password").unwrap();
        handle.join().unwrap();

        let captured = captured.lock().unwrap();
        let first = json::parse(&captured[0]).unwrap();
        assert_eq!(first["method"], "wallet_create");
        assert_eq!(first["params"][0], "default");
        let second = json::parse(&captured[1]).unwrap();
        assert_eq!(second["method"], "wallet_unlock");
        assert_eq!(second["params"][0], "9999999");
    }

    #[test]
    fn console_commands_travel_as_raw_lines() {
        let ok = json::object! { result: true }.dump();
        let (port, captured, handle) = mock_rpc_server(vec![ok]);
        let mut node = Node::connected_for_tests(port);
        node.control().execute_command_line("enable_raw").unwrap();
        handle.join().unwrap();

        let sent = json::parse(&captured.lock().unwrap()[0]).unwrap();
        assert_eq!(sent["method"], "execute_command_line");
        assert_eq!(sent["params"][0], "enable_raw");
    }

    #[test]
    fn funding_import_carries_create_and_rescan_flags() {
        let ok = json::object! { result: true }.dump();
        let (port, captured, handle) = mock_rpc_server(vec![ok]);
        let mut node = Node::connected_for_tests(port);
        node.wallet()
            .import_private_key_and_rescan("5KQw", "angel")
            .unwrap();
        handle.join().unwrap();

        let sent = json::parse(&captured.lock().unwrap()[0]).unwrap();
        assert_eq!(sent["method"], "wallet_import_private_key");
        assert_eq!(sent["params"][1], "angel");
        assert_eq!(sent["params"][2], true);
        assert_eq!(sent["params"][3], true);
    }
}
