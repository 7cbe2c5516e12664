//! Template assembly (C4): drives the priority queue, dependency
//! tracker and notarisation detector under the block's budget
//! constraints to emit a fully-formed, validated block template.

use crate::coinbase::{build_stake_tx, compose_coinbase, CoinbaseError, CoinbaseParams, Commission, StakeParams};
use crate::mempool::{
    Candidate, CandidateQueue, DependencyTracker, MempoolView, OrderMode, Orphan,
    NOTARISATION_PRIORITY,
};
use crate::notarization::{
    has_notarisation_shape, score_notary_signers, NotarisationSlot, NotarySignerOutcome,
};
use komodo_consensus::{merkle_root, Block, ChainFeatures, ChainKind, ConsensusError, ConsensusParams, NotarySet};
use komodo_utxo::{script, OutPoint, Transaction, UtxoError, UtxoViewMut};

/// `AllowFree`: Bitcoin Core's standard threshold, `COIN * 144 / 250`,
/// above which a zero-fee transaction may still be admitted in priority
/// mode (§4.1, §4.4 step 5 "mode flip").
const ALLOW_FREE_PRIORITY_THRESHOLD: f64 = 57_600_000.0;

/// Bytes reserved for the header/solution overhead outside `vtx` (§3
/// invariant: `Σ serialized_size(vtx) + 512 ≤ max block size`).
const BLOCK_HEADER_RESERVE: usize = 512;

const NOTARY_VIN_FEE_SATS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("utxo error: {0}")]
    Utxo(#[from] UtxoError),
    #[error("coinbase composition error: {0}")]
    Coinbase(#[from] CoinbaseError),
    #[error("block size limit exceeded")]
    SizeLimit,
}

#[derive(Debug, Clone, Copy)]
pub struct BuilderConfig {
    pub max_block_size: usize,
    pub priority_size: usize,
    pub min_block_size: usize,
    /// `-opretmintxfee`: minimum fee-rate (sat/byte) required once a
    /// transaction's OP_RETURN pushes exceed 256 bytes. `None` disables
    /// the filter (matches `-opretmintxfee=0`).
    pub opret_min_fee_rate: Option<f64>,
    pub max_block_sigops: usize,
    pub min_relay_fee_rate: f64,
    pub version: i32,
    /// Left-shift applied to the random value a fresh template seeds its
    /// header nonce with, before shifting right 16 to clear the bits a
    /// solver thread uses as its own counter (§4.4 step 10).
    pub nonce_shift: u32,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            max_block_size: 2_000_000,
            priority_size: 50_000,
            min_block_size: 0,
            opret_min_fee_rate: Some(400_000.0 / 1000.0),
            max_block_sigops: 20_000,
            min_relay_fee_rate: 0.0,
            version: 4,
            nonce_shift: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub tx_fees: Vec<i64>,
    pub tx_sigops: Vec<usize>,
    pub total_fees: u64,
    pub total_size: usize,
}

/// Context the builder needs beyond the mempool snapshot: chain tip
/// height/hash/time, the consensus parameter handle, the active notary
/// set, and whether this node itself is a notary (drives the coinbase
/// bonus and the empty-mempool notary-vin path, §4.4 step 12).
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub height: u32,
    pub prev_block_hash: [u8; 32],
    pub block_time: u32,
    pub bits: u32,
    pub miner_script: Vec<u8>,
    pub is_notary: bool,
    pub notaries: NotarySet,
    /// Stake coin selected by a staked chain's kernel-hash search, if
    /// any (§4.4 step 8). `None` on chains that don't stake, or when no
    /// eligible coin was found this round.
    pub stake_candidate: Option<StakeCandidate>,
}

/// A stake UTXO a staked chain's kernel-hash search already selected —
/// that search itself is out of scope here; this is just enough for the
/// builder to spend it back to the staker at template position 1.
#[derive(Debug, Clone)]
pub struct StakeCandidate {
    pub outpoint: OutPoint,
    pub value: u64,
    pub staker_script: Vec<u8>,
}

pub struct TemplateBuilder<'a> {
    config: BuilderConfig,
    consensus: &'a dyn ConsensusParams,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(config: BuilderConfig, consensus: &'a dyn ConsensusParams) -> Self {
        TemplateBuilder { config, consensus }
    }

    pub fn build(
        &self,
        mempool: &dyn MempoolView,
        view: &mut dyn UtxoViewMut,
        ctx: &BuildContext,
    ) -> Result<BlockTemplate, TemplateError> {
        let lock_time_cutoff = ctx.block_time;
        let mut queue = CandidateQueue::new(OrderMode::ByPriority);
        let mut tracker = DependencyTracker::new();
        let mut notarisation_slot = NotarisationSlot::new();
        let mempool_txids: Vec<[u8; 32]> = mempool.entries().iter().map(|e| e.txid).collect();

        for entry in mempool.entries() {
            self.score_entry(
                &entry.tx,
                entry.txid,
                view,
                ctx,
                mempool.delta_priority(&entry.txid),
                mempool.delta_fee(&entry.txid),
                lock_time_cutoff,
                &mempool_txids,
                &mut queue,
                &mut tracker,
                &mut notarisation_slot,
            )?;
        }
        tracker.discard_unresolvable(view, &mempool_txids);

        let (selected, total_fees) = self.select(
            queue,
            &mut tracker,
            view,
            ctx,
            mempool,
            &mempool_txids,
            &mut notarisation_slot,
            lock_time_cutoff,
        )?;

        let mut tx_fees = vec![-(total_fees as i64)];
        let mut tx_sigops = vec![0usize];
        let mut vtx: Vec<Transaction> = Vec::with_capacity(selected.len() + 2);

        let mut running_fees = total_fees;
        let mut running_size = BLOCK_HEADER_RESERVE;
        let mut running_sigops = 0usize;
        let features = self.consensus.features();

        if mempool.entries().is_empty() && ctx.is_notary && features.kind == ChainKind::Komodo {
            let vin_tx = build_notary_vin_tx(ctx.height);
            running_fees = running_fees.saturating_add(NOTARY_VIN_FEE_SATS);
            running_size += vin_tx.serialized_size()?;
            vtx.push(vin_tx);
            tx_fees.push(-(NOTARY_VIN_FEE_SATS as i64));
            tx_sigops.push(0);
        }

        if features.staked && features.kind != ChainKind::Komodo {
            if let Some(stake_candidate) = &ctx.stake_candidate {
                let (stake_tx, split) = build_stake_tx(&StakeParams {
                    stake_outpoint: stake_candidate.outpoint,
                    stake_value: stake_candidate.value,
                    staker_script: stake_candidate.staker_script.clone(),
                    split_percent: features.stake_split_percent,
                })?;
                running_fees = running_fees.saturating_add(split);
                running_size += stake_tx.serialized_size()?;
                tx_fees.push(-(split as i64));
                tx_sigops.push(0);
                vtx.push(stake_tx);
            }
        }

        for candidate in selected {
            running_size += candidate.size;
            running_sigops += candidate.sigops;
            tx_fees.push(candidate.fee);
            tx_sigops.push(candidate.sigops);
            vtx.push(candidate.tx);
        }

        let commission = if features.commission_enabled {
            let amount = (self.consensus.subsidy(ctx.height) as f64
                * features.commission_percent.clamp(0.0, 1.0)) as u64;
            (amount > 0).then(|| Commission {
                amount,
                pay_to_pubkey: features.commission_pubkey,
                pay_to_script: None,
            })
        } else {
            None
        };
        let notary_pay_signers = (features.notary_pay && notarisation_slot.is_claimed())
            .then(|| ctx.notaries.keys().to_vec());
        let timelock_threshold = features.timelock_coinbase.then_some(features.timelock_threshold);

        let coinbase = compose_coinbase(&CoinbaseParams {
            height: ctx.height,
            subsidy: self.consensus.subsidy(ctx.height),
            fees: running_fees,
            lock_time: ctx.block_time,
            miner_script: ctx.miner_script.clone(),
            is_notary: ctx.is_notary,
            fee_burn_active: features.fee_burn_active_at(ctx.height),
            commission,
            timelock_threshold,
            notary_pay_signers,
        })?;
        let mut final_vtx = Vec::with_capacity(vtx.len() + 1);
        final_vtx.push(coinbase);
        final_vtx.extend(vtx);

        let txids: Vec<[u8; 32]> = final_vtx
            .iter()
            .map(|tx| tx.txid())
            .collect::<Result<Vec<_>, _>>()?;
        let root = merkle_root(&txids);
        let block = Block {
            header: komodo_consensus::BlockHeader {
                version: self.config.version,
                prev_block_hash: ctx.prev_block_hash,
                merkle_root: root,
                time: ctx.block_time,
                bits: ctx.bits,
                nonce: seed_nonce(self.config.nonce_shift),
                solution: Vec::new(),
            },
            txs: final_vtx,
        };

        if running_size > self.config.max_block_size {
            return Err(TemplateError::SizeLimit);
        }

        Ok(BlockTemplate {
            block,
            tx_fees,
            tx_sigops,
            total_fees: running_fees,
            total_size: running_size,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn score_entry(
        &self,
        tx: &Transaction,
        txid: [u8; 32],
        view: &dyn komodo_utxo::UtxoView,
        ctx: &BuildContext,
        delta_priority: f64,
        delta_fee: i64,
        lock_time_cutoff: u32,
        mempool_txids: &[[u8; 32]],
        queue: &mut CandidateQueue,
        tracker: &mut DependencyTracker,
        notarisation_slot: &mut NotarisationSlot,
    ) -> Result<(), TemplateError> {
        match score_tx(
            tx,
            txid,
            view,
            ctx,
            self.consensus.features(),
            delta_priority,
            delta_fee,
            lock_time_cutoff,
            mempool_txids,
        )? {
            ScoreOutcome::Skip => {}
            ScoreOutcome::Orphan {
                candidate,
                depends_on,
            } => tracker.add_orphan(Orphan {
                candidate,
                depends_on,
            }),
            ScoreOutcome::Ready(mut candidate) => {
                self.apply_notarisation_finalisation(
                    &mut candidate,
                    view,
                    &ctx.notaries,
                    notarisation_slot,
                );
                queue.push(candidate);
            }
        }
        Ok(())
    }

    fn apply_notarisation_finalisation(
        &self,
        candidate: &mut Candidate,
        view: &dyn komodo_utxo::UtxoView,
        notaries: &NotarySet,
        slot: &mut NotarisationSlot,
    ) {
        if notaries.is_empty() || slot.is_claimed() {
            return;
        }
        let outcome = score_notary_signers(&candidate.tx, view, notaries);
        if !matches!(outcome, NotarySignerOutcome::Qualifies { .. }) {
            return;
        }
        if !has_notarisation_shape(&candidate.tx, extract_notarized_height) {
            return;
        }
        if slot.try_claim(candidate.txid) {
            candidate.priority = NOTARISATION_PRIORITY;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn select(
        &self,
        mut queue: CandidateQueue,
        tracker: &mut DependencyTracker,
        view: &mut dyn UtxoViewMut,
        ctx: &BuildContext,
        mempool: &dyn MempoolView,
        mempool_txids: &[[u8; 32]],
        notarisation_slot: &mut NotarisationSlot,
        lock_time_cutoff: u32,
    ) -> Result<(Vec<Candidate>, u64), TemplateError> {
        let mut selected = Vec::new();
        let mut running_size = 0usize;
        let mut running_sigops = 0usize;
        let mut total_fees: u64 = 0;

        'outer: loop {
            let Some(candidate) = queue.pop() else {
                break;
            };
            if running_size + candidate.size > self.config.max_block_size - BLOCK_HEADER_RESERVE {
                continue;
            }
            if let Some(min_rate) = self.config.opret_min_fee_rate {
                let opret_bytes = total_op_return_bytes(&candidate.tx);
                if opret_bytes > 256 && candidate.fee_rate < min_rate {
                    continue;
                }
            }
            if running_sigops + candidate.sigops >= self.config.max_block_sigops.saturating_sub(1)
            {
                continue;
            }

            if queue.mode() == OrderMode::ByPriority {
                let should_flip = running_size + candidate.size >= self.config.priority_size
                    || candidate.priority <= ALLOW_FREE_PRIORITY_THRESHOLD;
                if should_flip {
                    queue.flip_to_fee_mode();
                    if !self.passes_free_tx_gate(&candidate, running_size) {
                        continue 'outer;
                    }
                }
            } else if !self.passes_free_tx_gate(&candidate, running_size) {
                continue;
            }

            view.update_coins(&candidate.tx, ctx.height)?;
            running_size += candidate.size;
            running_sigops += candidate.sigops;
            total_fees = total_fees.saturating_add(candidate.fee.max(0) as u64);

            // Re-score dependents now that this parent's outputs are
            // visible: their priority/fee were necessarily incomplete
            // when first parked (§4.2's "final (priority, fee-rate)").
            for child_tx in tracker.release_parent(&candidate.txid) {
                let child_txid = child_tx.txid()?;
                match score_tx(
                    &child_tx,
                    child_txid,
                    view,
                    ctx,
                    self.consensus.features(),
                    mempool.delta_priority(&child_txid),
                    mempool.delta_fee(&child_txid),
                    lock_time_cutoff,
                    mempool_txids,
                )? {
                    ScoreOutcome::Ready(mut released_candidate) => {
                        self.apply_notarisation_finalisation(
                            &mut released_candidate,
                            view,
                            &ctx.notaries,
                            notarisation_slot,
                        );
                        queue.push(released_candidate);
                    }
                    ScoreOutcome::Orphan {
                        candidate,
                        depends_on,
                    } => tracker.add_orphan(Orphan {
                        candidate,
                        depends_on,
                    }),
                    ScoreOutcome::Skip => {}
                }
            }

            selected.push(candidate);
        }

        Ok((selected, total_fees))
    }

    fn passes_free_tx_gate(&self, candidate: &Candidate, running_size: usize) -> bool {
        let free_tx = candidate.delta_fee <= 0
            && candidate.delta_priority <= 0.0
            && candidate.fee_rate < self.config.min_relay_fee_rate
            && running_size >= self.config.min_block_size;
        !free_tx
    }
}

/// Seeds a fresh template's header nonce (§4.4 step 10): a random value
/// shifted to clear the low bits a solver thread treats as its own
/// counter, so concurrent workers sharing one template don't retread
/// each other's nonce space.
fn seed_nonce(nonce_shift: u32) -> u32 {
    let raw: u32 = rand::random();
    raw.wrapping_shl(nonce_shift).wrapping_shr(16)
}

/// Result of scoring one transaction against the current UTXO view
/// (§4.4 step 4), before notarisation finalisation is applied.
enum ScoreOutcome {
    /// Not final, expired, or references a coin nowhere in the view or
    /// mempool.
    Skip,
    /// References at least one coin that belongs to another mempool
    /// transaction not yet admitted.
    Orphan {
        candidate: Candidate,
        depends_on: Vec<[u8; 32]>,
    },
    Ready(Candidate),
}

/// vout sentinel marking a coin-import transaction's lone input: real
/// prevouts never carry this index, so it cannot collide with a genuine
/// UTXO reference (§4.4 step 4, `IsCoinImport`).
const COIN_IMPORT_MARKER_VOUT: u32 = 0xffff_fffe;

/// Reads the burn amount off a coin-import transaction's marker input,
/// if `tx` has the shape of one: a single vin pointing at
/// [`COIN_IMPORT_MARKER_VOUT`], with the burn amount packed as the first
/// 8 little-endian bytes of its `script_sig`. The precise wire format a
/// real coin-import transaction carries lives in the external import
/// validator (out of scope here); this is a stand-in shape this builder
/// can recognise without it.
fn coin_import_burn_amount(tx: &Transaction) -> Option<u64> {
    if tx.vin.len() != 1 || tx.vin[0].prevout.vout != COIN_IMPORT_MARKER_VOUT {
        return None;
    }
    let bytes: [u8; 8] = tx.vin[0].script_sig.get(0..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[allow(clippy::too_many_arguments)]
fn score_tx(
    tx: &Transaction,
    txid: [u8; 32],
    view: &dyn komodo_utxo::UtxoView,
    ctx: &BuildContext,
    features: ChainFeatures,
    delta_priority: f64,
    delta_fee: i64,
    lock_time_cutoff: u32,
    mempool_txids: &[[u8; 32]],
) -> Result<ScoreOutcome, TemplateError> {
    if tx.is_coinbase {
        return Ok(ScoreOutcome::Skip);
    }
    if !tx.is_final(ctx.height, lock_time_cutoff) {
        return Ok(ScoreOutcome::Skip);
    }
    if tx.is_expired(ctx.height) {
        return Ok(ScoreOutcome::Skip);
    }
    let value_out = match tx.value_out() {
        Ok(v) => v,
        Err(_) => return Ok(ScoreOutcome::Skip),
    };

    let mut value_in: u64;
    let mut priority_numerator: f64;
    let mut depends_on = Vec::new();

    if let Some(burn_amount) = coin_import_burn_amount(tx) {
        value_in = burn_amount;
        priority_numerator = burn_amount as f64 * 1000.0;
    } else {
        value_in = 0;
        priority_numerator = 0.0;
        let mut missing = false;
        for vin in &tx.vin {
            match view.access_coin(&vin.prevout) {
                Some(coin) => {
                    value_in = value_in.saturating_add(coin.txout.value);
                    let conf = ctx.height.saturating_sub(coin.height);
                    priority_numerator += coin.txout.value as f64 * conf as f64;
                }
                None => {
                    if mempool_txids.contains(&vin.prevout.txid) {
                        depends_on.push(vin.prevout.txid);
                    } else {
                        missing = true;
                    }
                }
            }
        }
        if missing {
            return Ok(ScoreOutcome::Skip);
        }
        if depends_on.is_empty() && features.validates_interest() {
            if let Ok((_, interest)) = view.get_value_in(tx) {
                value_in = value_in.saturating_add(interest);
            }
        }
    }

    let modified_size = tx.modified_size()? as f64;
    let priority = (priority_numerator + delta_priority) / modified_size;
    let size = tx.serialized_size()?;
    let fee = (value_in as i64 - value_out as i64) + delta_fee;
    let fee_rate = if size == 0 { 0.0 } else { fee as f64 / size as f64 };
    let sigops = tx.sigop_count();

    let candidate = Candidate {
        priority,
        fee_rate,
        fee,
        size,
        sigops,
        txid,
        tx: tx.clone(),
        delta_priority,
        delta_fee,
    };

    if !depends_on.is_empty() {
        return Ok(ScoreOutcome::Orphan {
            candidate,
            depends_on,
        });
    }
    Ok(ScoreOutcome::Ready(candidate))
}

fn total_op_return_bytes(tx: &Transaction) -> usize {
    tx.vout
        .iter()
        .filter(|out| script::is_op_return(&out.script_pubkey))
        .map(|out| out.script_pubkey.len().saturating_sub(1))
        .sum()
}

/// Placeholder for the external `extract_notarized_height` collaborator
/// (§4.3): real height extraction depends on the notarisation opret
/// wire format, which is out of scope here. Treats any non-empty
/// OP_RETURN payload as carrying a (nonzero) height.
fn extract_notarized_height(op_return_script: &[u8]) -> u32 {
    if op_return_script.len() > 1 {
        1
    } else {
        0
    }
}

/// The synthetic notarisation-funding transaction appended when the
/// mempool is empty on a Komodo chain and this node is a notary (§4.4
/// step 12): its OP_RETURN carries the notary opret payload, funded by
/// 5000 sats diverted from the coinbase.
fn build_notary_vin_tx(height: u32) -> Transaction {
    let mut payload = vec![script::OP_RETURN];
    payload.extend(b"komodo-notary-opret");
    payload.extend(height.to_le_bytes());
    Transaction {
        version: 1,
        vin: vec![],
        vout: vec![komodo_utxo::TxOut {
            value: NOTARY_VIN_FEE_SATS,
            script_pubkey: payload,
        }],
        lock_time: 0,
        expiry_height: 0,
        shielded_spends: vec![],
        shielded_outputs: vec![],
        joinsplits: vec![],
        is_coinbase: false,
    }
}
