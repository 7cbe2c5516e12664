//! Daemon binary: parses the miner's CLI surface, loads an offline
//! mempool/UTXO snapshot, and either emits one block template or runs
//! the mining driver against it until a block is found or shutdown is
//! requested.

use clap::{Parser, ValueEnum};
use komodo_consensus::{ChainFeatures, ChainKind, NotarySet, StaticConsensusParams};
use komodo_miner::block_template::BuilderConfig;
use komodo_miner::driver::{self, AlwaysReady, GlobalMiningState};
use komodo_miner::mempool::InMemoryMempool;
use komodo_miner::solver::{CancelToken, DefaultSolver};
use komodo_utxo::{Coin, InMemoryUtxoView, OutPoint, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
enum MinerCliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {0} bytes, got {1}")]
    WrongLength(usize, usize),
    #[error("consensus error: {0}")]
    Consensus(#[from] komodo_consensus::ConsensusError),
    #[error("template error: {0}")]
    Template(#[from] komodo_miner::block_template::TemplateError),
    #[error("driver error: {0}")]
    Driver(#[from] driver::DriverError),
    #[error("mempool error: {0}")]
    Mempool(#[from] komodo_miner::mempool::MempoolError),
    #[error("-gen requires -mineraddress when the wallet is disabled")]
    NoMinerAddress,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChainKindArg {
    Komodo,
    NotaryPay,
    AdaptivePow,
    Generic,
}

impl From<ChainKindArg> for ChainKind {
    fn from(value: ChainKindArg) -> Self {
        match value {
            ChainKindArg::Komodo => ChainKind::Komodo,
            ChainKindArg::NotaryPay => ChainKind::NotaryPay,
            ChainKindArg::AdaptivePow => ChainKind::AdaptivePow,
            ChainKindArg::Generic => ChainKind::Generic,
        }
    }
}

/// CLI surface mapping §6's config options onto a parsed, then
/// normalized, struct — mirroring how the teacher's own `Cli` is parsed
/// and validated field-by-field before use.
#[derive(Debug, Parser)]
#[command(name = "komodo-miner", version, about = "Komodo-lineage block template and mining daemon")]
struct MinerConfig {
    /// -blockmaxsize: clamp [1000, max_block_size(height) - 1000]
    #[arg(long = "blockmaxsize", default_value_t = 2_000_000)]
    block_max_size: usize,
    /// -blockprioritysize: clamp <= blockmaxsize; 0 => start in fee mode
    #[arg(long = "blockprioritysize", default_value_t = 50_000)]
    block_priority_size: usize,
    /// -blockminsize: clamp <= blockmaxsize
    #[arg(long = "blockminsize", default_value_t = 0)]
    block_min_size: usize,
    /// -opretmintxfee: sat/kB; 0 disables the OP_RETURN anti-spam filter
    #[arg(long = "opretmintxfee", default_value_t = 400_000.0)]
    opret_min_tx_fee: f64,
    /// -printpriority: log.debug! each admitted transaction
    #[arg(long = "printpriority", default_value_t = false)]
    print_priority: bool,
    /// -blockversion: regtest-only header version override
    #[arg(long = "blockversion")]
    block_version: Option<i32>,
    /// -gen: enable mining
    #[arg(long = "gen", default_value_t = false)]
    gen: bool,
    /// -mineraddress: hex-encoded coinbase scriptPubKey
    #[arg(long = "mineraddress")]
    miner_address: Option<String>,
    /// -disablewallet: no reserved key, -mineraddress is mandatory if -gen
    #[arg(long = "disablewallet", default_value_t = false)]
    disable_wallet: bool,

    /// Chain tip height to build on top of
    #[arg(long, default_value_t = 1)]
    height: u32,
    /// Previous block hash, hex-encoded
    #[arg(long)]
    prev_hash: String,
    /// Compact target bits
    #[arg(long, default_value_t = 0x207fffff)]
    bits: u32,
    /// Block time override (unix seconds); defaults to now
    #[arg(long)]
    block_time: Option<u32>,
    /// Chain variant selecting notary-bonus/interest-validation behaviour
    #[arg(long = "chain-kind", value_enum, default_value_t = ChainKindArg::Komodo)]
    chain_kind: ChainKindArg,
    /// This node's notary status (drives the coinbase bonus)
    #[arg(long = "is-notary", default_value_t = false)]
    is_notary: bool,
    /// Active notary pubkeys, hex-encoded 33 bytes each, repeatable
    #[arg(long = "notary-pubkey")]
    notary_pubkeys: Vec<String>,

    /// Optional UTXO snapshot (JSON Lines of `UtxoEntry`)
    #[arg(long)]
    utxo: Option<PathBuf>,
    /// Optional mempool snapshot (JSON Lines of `Transaction`)
    #[arg(long)]
    txs: Option<PathBuf>,
    /// Output path for the produced block template or mined block
    #[arg(long)]
    out: Option<PathBuf>,
    /// Mining worker thread count (only meaningful with -gen)
    #[arg(long, default_value_t = 1)]
    threads: usize,
    /// Upper bound on solver attempts per template (offline stand-in solver)
    #[arg(long, default_value_t = 200_000)]
    max_attempts: u32,

    /// This node's notary id, if any (drives the easy-mine/HF22 windows)
    #[arg(long = "notary-id")]
    notary_id: Option<u8>,
    /// Whether the HF22 second-block relaxation is active at this height
    #[arg(long = "hf22-active", default_value_t = false)]
    hf22_active: bool,
    /// Chain tip's block time, for the HF22 future-time comparison;
    /// defaults to 60 seconds before the candidate's own block time
    #[arg(long = "tip-time")]
    tip_time: Option<u32>,
    /// Compact bits for the stake-mode PoW ceiling (staked chains only)
    #[arg(long = "stake-pow-bits")]
    stake_pow_bits: Option<u32>,
}

impl MinerConfig {
    /// Applies the clamping rules from §6 now that the consensus-level
    /// max block size for `height` is known.
    fn normalize(&mut self, consensus_max_block_size: usize) {
        let ceiling = consensus_max_block_size.saturating_sub(1000).max(1000);
        self.block_max_size = self.block_max_size.clamp(1000, ceiling);
        self.block_priority_size = self.block_priority_size.min(self.block_max_size);
        self.block_min_size = self.block_min_size.min(self.block_max_size);
    }

    fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            max_block_size: self.block_max_size,
            priority_size: self.block_priority_size,
            min_block_size: self.block_min_size,
            opret_min_fee_rate: if self.opret_min_tx_fee <= 0.0 {
                None
            } else {
                Some(self.opret_min_tx_fee / 1000.0)
            },
            max_block_sigops: 20_000,
            min_relay_fee_rate: 0.0,
            version: self.block_version.unwrap_or(4),
            nonce_shift: 16,
        }
    }
}

/// One line of a JSONL UTXO snapshot: a coin plus the outpoint it sits
/// at, since [`Coin`] alone doesn't carry its own key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UtxoEntry {
    outpoint: OutPoint,
    coin: Coin,
}

fn decode_hex_32(s: &str) -> Result<[u8; 32], MinerCliError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(MinerCliError::WrongLength(32, bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn load_utxo_view(path: Option<&PathBuf>) -> Result<InMemoryUtxoView, MinerCliError> {
    let mut view = InMemoryUtxoView::new();
    let Some(path) = path else {
        return Ok(view);
    };
    for line in BufReader::new(fs::File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: UtxoEntry = serde_json::from_str(&line)?;
        view.insert(entry.outpoint, entry.coin);
    }
    Ok(view)
}

fn load_mempool(path: Option<&PathBuf>) -> Result<InMemoryMempool, MinerCliError> {
    let mut mempool = InMemoryMempool::new();
    let Some(path) = path else {
        return Ok(mempool);
    };
    for line in BufReader::new(fs::File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let tx: Transaction = serde_json::from_str(&line)?;
        mempool.insert(tx)?;
    }
    Ok(mempool)
}

fn now_unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn run() -> Result<(), MinerCliError> {
    env_logger::init();
    let mut config = MinerConfig::parse();

    if config.gen && config.disable_wallet && config.miner_address.is_none() {
        log::error!("-gen requires -mineraddress when the wallet is disabled");
        return Err(MinerCliError::NoMinerAddress);
    }

    let miner_script = match &config.miner_address {
        Some(hex_script) => hex::decode(hex_script)?,
        None => Vec::new(),
    };
    let prev_block_hash = decode_hex_32(&config.prev_hash)?;
    let notaries = {
        let mut keys = Vec::with_capacity(config.notary_pubkeys.len());
        for pubkey_hex in &config.notary_pubkeys {
            let bytes = hex::decode(pubkey_hex)?;
            if bytes.len() != 33 {
                return Err(MinerCliError::WrongLength(33, bytes.len()));
            }
            let mut key = [0u8; 33];
            key.copy_from_slice(&bytes);
            keys.push(key);
        }
        NotarySet::new(keys)?
    };

    let consensus = StaticConsensusParams {
        features: ChainFeatures {
            kind: config.chain_kind.into(),
            ..ChainFeatures::komodo()
        },
        ..Default::default()
    };
    config.normalize(consensus.max_block_size);

    let view = load_utxo_view(config.utxo.as_ref())?;
    let mempool = load_mempool(config.txs.as_ref())?;
    let block_time = config.block_time.unwrap_or_else(now_unix_seconds);

    let ctx = komodo_miner::block_template::BuildContext {
        height: config.height,
        prev_block_hash,
        block_time,
        bits: config.bits,
        miner_script,
        is_notary: config.is_notary,
        notaries,
        stake_candidate: None,
    };

    if config.print_priority {
        log::debug!("printpriority enabled: admitted transactions will be logged at debug level");
    }

    if !config.gen {
        let builder =
            komodo_miner::block_template::TemplateBuilder::new(config.builder_config(), &consensus);
        let mut view = view;
        let template = builder.build(&mempool, &mut view, &ctx)?;
        log::info!(
            "built template at height {} with {} txs, total fees {}",
            config.height,
            template.block.txs.len(),
            template.total_fees
        );
        if let Some(out) = &config.out {
            fs::write(out, serde_json::to_string_pretty(&template.block)?)?;
        }
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown requested, interrupting mining workers");
            shutdown.store(true, AtomicOrdering::SeqCst);
        })
        .expect("failed to install Ctrl-C handler");
    }

    let state = GlobalMiningState::new();
    let cancel = CancelToken::new();
    let solver = DefaultSolver {
        max_attempts: config.max_attempts,
    };
    let view_mutex = Mutex::new(view);
    let found_block = Arc::new(Mutex::new(None));

    let identity = driver::MiningIdentity {
        notary_id: config.notary_id,
        is_notary: config.is_notary,
        hf22_active: config.hf22_active,
        max_future_block_time: 60,
    };
    let eligible = driver::EligibleNotaryData::default();
    let tip_time = config.tip_time.unwrap_or_else(|| block_time.saturating_sub(60));

    let outcome = {
        let found_block = found_block.clone();
        driver::run_worker(
            0,
            &shutdown,
            &state,
            &AlwaysReady,
            &solver,
            &cancel,
            &consensus,
            config.builder_config(),
            &mempool,
            &view_mutex,
            &identity,
            &eligible,
            tip_time,
            config.stake_pow_bits,
            |height| {
                let mut next = ctx.clone();
                next.height = height;
                next
            },
            move |block| {
                *found_block.lock() = Some(block.clone());
                true
            },
        )
    };
    outcome?;

    if let Some(block) = found_block.lock().take() {
        log::info!("mined block at height {}", config.height);
        if let Some(out) = &config.out {
            fs::write(out, serde_json::to_string_pretty(&block)?)?;
        }
    } else {
        log::info!("no block found before shutdown");
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        log::error!("{err}");
        std::process::exit(1);
    }
}
