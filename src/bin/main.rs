//! Beespv CLI - drive one wallet from the shell
//!
//!   beespv create [--passphrase <p>]      → Create wallet, print first address
//!   beespv address [--new]                → Receive address (or add a key)
//!   beespv balance                        → {"confirmed": .., "unconfirmed": .., "total": ..}
//!   beespv history [--limit <n>]          → Transactions, newest first
//!   beespv sync                           → Sync until caught up or Ctrl+C
//!   beespv send <address> <sats>          → Prepare, commit, broadcast
//!   beespv export <path> | import <path>  → Wallet file copy
//!   beespv encrypt | decrypt              → Key encryption (needs --passphrase)
//!   beespv dump-keys                      → WIF keys, one per line
//!
//! Configuration (flags override environment):
//!   --app / BEESPV_APP, --network / BEESPV_NETWORK, --data-dir / BEESPV_ROOT,
//!   --peer <host:port> (repeatable), --no-listen, --min-depth, --fee-rate

use std::env;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use beespv::logging::init_logging;
use beespv::{install_signal_handlers, parse_network, ManagerConfig, SyncPhase, WalletEvent, WalletManager};
use serde_json::{json, Value};
use tracing::{debug, info};

const SEND_WAIT: Duration = Duration::from_secs(120);

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }
    if opts.version {
        println!("beespv {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("create") => cmd_create(&opts),
        Some("address") => cmd_address(&opts),
        Some("balance") => cmd_balance(&opts),
        Some("history") => cmd_history(&opts),
        Some("sync") => cmd_sync(&opts),
        Some("send") => cmd_send(&opts),
        Some("export") => cmd_export(&opts),
        Some("import") => cmd_import(&opts),
        Some("encrypt") => cmd_encrypt(&opts),
        Some("decrypt") => cmd_decrypt(&opts),
        Some("dump-keys") => cmd_dump_keys(&opts),
        Some(cmd) => Err(anyhow!("Unknown command: {cmd}")),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = opts.pretty || std::io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": format!("{e:#}") }), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let text = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    text.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    positional: Vec<String>,
    app: Option<String>,
    network: Option<String>,
    data_dir: Option<String>,
    passphrase: Option<String>,
    new_passphrase: Option<String>,
    peers: Vec<String>,
    no_listen: bool,
    min_depth: Option<u32>,
    fee_rate: Option<u64>,
    limit: Option<usize>,
    new_key: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            let next = args.get(i + 1).cloned();
            let mut took = true;
            match arg.as_str() {
                "--help" | "-h" => { opts.help = true; took = false; }
                "--version" | "-V" => { opts.version = true; took = false; }
                "--pretty" => { opts.pretty = true; took = false; }
                "--no-listen" => { opts.no_listen = true; took = false; }
                "--new" => { opts.new_key = true; took = false; }
                "--app" | "-a" => opts.app = next,
                "--network" | "-n" => opts.network = next,
                "--data-dir" | "-d" => opts.data_dir = next,
                "--passphrase" | "-p" => opts.passphrase = next,
                "--new-passphrase" => opts.new_passphrase = next,
                "--peer" => opts.peers.extend(next),
                "--min-depth" => opts.min_depth = next.and_then(|v| v.parse().ok()),
                "--fee-rate" => opts.fee_rate = next.and_then(|v| v.parse().ok()),
                "--limit" => opts.limit = next.and_then(|v| v.parse().ok()),
                _ if !arg.starts_with('-') => { positional.push(arg.clone()); took = false; }
                other => { debug!(flag = other, "Ignoring unknown flag"); took = false; }
            }
            i += if took { 2 } else { 1 };
        }

        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }
        opts.positional = positional;

        if opts.app.is_none() {
            opts.app = env::var("BEESPV_APP").ok().filter(|s| !s.is_empty());
        }
        if opts.network.is_none() {
            opts.network = env::var("BEESPV_NETWORK").ok().filter(|s| !s.is_empty());
        }
        if opts.passphrase.is_none() {
            opts.passphrase = env::var("BEESPV_PASSPHRASE").ok().filter(|s| !s.is_empty());
        }
        if opts.peers.is_empty() {
            if let Ok(peers) = env::var("BEESPV_PEERS") {
                opts.peers = peers.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
        }
        opts
    }

    fn arg(&self, index: usize, name: &str) -> Result<&str> {
        self.positional.get(index).map(String::as_str).ok_or_else(|| anyhow!("missing <{name}>"))
    }

    fn config(&self) -> Result<ManagerConfig> {
        let mut config = ManagerConfig::new(self.app.clone().unwrap_or_else(|| "beespv".into()));
        if let Some(network) = &self.network {
            config = config.with_network(parse_network(network)?);
        }
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(PathBuf::from(dir));
        }
        if let Some(depth) = self.min_depth {
            config = config.with_min_depth(depth);
        }
        if let Some(rate) = self.fee_rate {
            config = config.with_fee_rate(rate);
        }
        for peer in &self.peers {
            let addr: SocketAddr = peer.parse().with_context(|| format!("bad --peer {peer}"))?;
            config = config.with_peer(addr);
        }
        if self.no_listen {
            config = config.disable_listening();
        }
        Ok(config)
    }
}

/// Initialized manager with the existing wallet loaded.
fn open(opts: &ParsedArgs) -> Result<WalletManager> {
    let mut manager = WalletManager::new(opts.config()?)?;
    manager.initialize()?;
    manager.load_wallet()?;
    Ok(manager)
}

fn passphrase(opts: &ParsedArgs) -> Result<&str> {
    opts.passphrase.as_deref().ok_or_else(|| anyhow!("--passphrase required"))
}

fn cmd_create(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = WalletManager::new(opts.config()?)?;
    manager.initialize()?;
    manager.create_wallet(opts.passphrase.as_deref())?;
    let address = manager.wallet_address()?.map(|a| a.to_string());
    let path = manager.wallet_path()?;
    manager.stop()?;
    Ok(json!({ "wallet": path.display().to_string(), "address": address }))
}

fn cmd_address(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = open(opts)?;
    let address = if opts.new_key { Some(manager.add_key()?) } else { manager.wallet_address()? };
    let all: Vec<String> = manager.all_wallet_addresses()?.iter().map(ToString::to_string).collect();
    manager.stop()?;
    Ok(json!({ "address": address.map(|a| a.to_string()), "all": all }))
}

fn cmd_balance(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = open(opts)?;
    let balance = manager.balance()?;
    manager.stop()?;
    Ok(json!({ "confirmed": balance.confirmed, "unconfirmed": balance.unconfirmed, "total": balance.total() }))
}

fn cmd_history(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = open(opts)?;
    let txs = manager.all_transactions(opts.limit.unwrap_or(0))?;
    manager.stop()?;
    Ok(Value::Array(txs.iter().map(|t| t.to_json()).collect()))
}

fn cmd_sync(opts: &ParsedArgs) -> Result<Value> {
    let signals = tokio::runtime::Builder::new_multi_thread().worker_threads(1).enable_all().build()?;
    let shutdown = {
        let _guard = signals.enter();
        install_signal_handlers()
    };

    let mut manager = open(opts)?;
    manager.start_blockchain()?;
    let mut last_report = Instant::now();
    loop {
        let state = manager.sync_state();
        if state.phase == SyncPhase::Synced || shutdown.is_triggered() {
            break;
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            info!(phase = ?state.phase, height = state.current_height, target = state.target_height, peers = state.peer_count, "Syncing");
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    let state = manager.sync_state();
    let balance = manager.balance()?;
    manager.stop()?;
    Ok(json!({ "state": state, "balance": balance }))
}

fn cmd_send(opts: &ParsedArgs) -> Result<Value> {
    let destination = opts.arg(0, "address")?;
    let amount: u64 = opts.arg(1, "sats")?.parse().context("amount must be satoshis")?;

    let mut manager = open(opts)?;
    if !manager.is_address_valid(destination) {
        bail!("{destination} is not a valid address on this network");
    }
    let mut events = manager.subscribe();
    manager.start_blockchain()?;
    let prepared = manager.prepare_send(amount, destination, None, opts.passphrase.as_deref())?;
    info!(txid = %prepared.txid, fee = prepared.fee, "Prepared");
    let txid = manager.commit_send()?;

    let deadline = Instant::now() + SEND_WAIT;
    let mut broadcast = false;
    while Instant::now() < deadline && !broadcast {
        match events.try_recv() {
            Ok(WalletEvent::TransactionBroadcast { txid: sent }) if sent == txid => broadcast = true,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(200)),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::TryRecvError::Closed) => break,
        }
    }
    manager.stop()?;
    Ok(json!({
        "txid": txid.to_string(),
        "amount": prepared.amount,
        "fee": prepared.fee,
        "destination": prepared.destination.to_string(),
        "broadcast": broadcast,
    }))
}

fn cmd_export(opts: &ParsedArgs) -> Result<Value> {
    let path = PathBuf::from(opts.arg(0, "path")?);
    let mut manager = open(opts)?;
    manager.export_wallet(&path)?;
    manager.stop()?;
    Ok(json!({ "exported": path.display().to_string() }))
}

fn cmd_import(opts: &ParsedArgs) -> Result<Value> {
    let path = PathBuf::from(opts.arg(0, "path")?);
    let mut manager = WalletManager::new(opts.config()?)?;
    manager.initialize()?;
    if !manager.wallet_exists()? {
        manager.create_wallet(None)?;
    } else {
        manager.load_wallet()?;
    }
    manager.import_wallet(&path)?;
    let count = manager.transaction_count()?;
    manager.stop()?;
    Ok(json!({ "imported": path.display().to_string(), "transactions": count }))
}

fn cmd_encrypt(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = open(opts)?;
    match opts.new_passphrase.as_deref() {
        Some(new) => manager.change_passphrase(opts.passphrase.as_deref(), new)?,
        None => manager.encrypt(passphrase(opts)?)?,
    }
    manager.stop()?;
    Ok(json!({ "encrypted": true }))
}

fn cmd_decrypt(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = open(opts)?;
    manager.decrypt(passphrase(opts)?)?;
    manager.stop()?;
    Ok(json!({ "encrypted": false }))
}

fn cmd_dump_keys(opts: &ParsedArgs) -> Result<Value> {
    let mut manager = open(opts)?;
    let keys = manager.dump_keys(opts.passphrase.as_deref())?;
    manager.stop()?;
    Ok(Value::Array(keys.lines().map(|k| Value::String(k.to_string())).collect()))
}

fn print_usage() {
    println!(
        r#"beespv - SPV Bitcoin wallet

USAGE:
    beespv <command> [args] [options]

COMMANDS:
    create                 Create a new wallet
    address [--new]        Show the receive address, or add a key
    balance                Confirmed and unconfirmed balance
    history [--limit N]    Transactions, newest first
    sync                   Sync with the network until caught up
    send <addr> <sats>     Send and wait for broadcast
    export <path>          Copy the wallet file
    import <path>          Replace the wallet with a file
    encrypt                Encrypt keys (or change with --new-passphrase)
    decrypt                Remove encryption
    dump-keys              Print private keys (WIF)

OPTIONS:
    -a, --app <name>         App name (BEESPV_APP, default beespv)
    -n, --network <net>      main | test | signet | regtest (BEESPV_NETWORK)
    -d, --data-dir <path>    Data directory (BEESPV_ROOT)
    -p, --passphrase <p>     Wallet passphrase (BEESPV_PASSPHRASE)
        --new-passphrase <p> New passphrase for encrypt
        --peer <host:port>   Connect to this peer (BEESPV_PEERS, comma list)
        --no-listen          Only use --peer, no DNS seeds
        --min-depth <n>      Confirmations before coins count as confirmed
        --fee-rate <sat/vB>  Fee rate for sends
        --pretty             Pretty-print JSON
    -h, --help               Show this help
    -V, --version            Show version

LOGGING:
    RUST_LOG=debug           Verbose logs on stderr
    BEESPV_LOG_JSON=1        JSON log lines"#
    );
}
