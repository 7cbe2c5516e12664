//! Mining driver (C6): the per-thread loop that rebuilds a template,
//! applies the KMD difficulty windows, drives the solver, and validates
//! whatever it finds before handing it to submission (§4.6).

use crate::block_template::{BuildContext, BuilderConfig, TemplateBuilder, TemplateError};
use crate::mempool::MempoolView;
use crate::solver::{CancelToken, SolveOutcome, Solution, SolverBackend, SolverError};
use komodo_consensus::{check_pow, BlockHeader, ConsensusError, ConsensusParams};
use komodo_utxo::UtxoViewMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::thread;
use std::time::Duration;

/// `KOMODO_MINDIFF_NBITS`: the relaxed target granted during an
/// easy-mine or HF22 second-block window (§4.6 step 4).
pub const KOMODO_MINDIFF_NBITS: u32 = 0x200f0f0f;

/// Process-wide counters the driver reads and writes, standing in for
/// `nLastBlockTx`/`Mining_height`/`KOMODO_LASTMINED` (§9: "treat as a
/// process-wide state struct with explicit read/write ownership,
/// initialised at node startup, written only by the mining driver or
/// the block-accept hook").
#[derive(Debug, Default)]
pub struct GlobalMiningState {
    pub mining_height: AtomicU32,
    pub komodo_lastmined: AtomicU32,
    pub komodo_maybemined: AtomicU32,
    tip_changed: AtomicBool,
}

impl GlobalMiningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the block-accept hook, not from a mining thread.
    pub fn mark_tip_changed(&self) {
        self.tip_changed.store(true, AtomicOrdering::SeqCst);
    }

    /// Consumes the tip-changed flag: `true` at most once per actual
    /// change, so a driver loop can tell "the tip moved since my last
    /// check" from "nothing happened".
    pub fn take_tip_changed(&self) -> bool {
        self.tip_changed.swap(false, AtomicOrdering::SeqCst)
    }
}

/// Stand-in for the peer-list/sync-state gate (§4.6 step 1, §5
/// "cs_vNodes"). A chain that doesn't require peers (regtest, a local
/// test harness) can use [`AlwaysReady`].
pub trait PeerGate {
    fn requires_peers(&self) -> bool;
    fn has_peers(&self) -> bool;
    fn in_sync(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl PeerGate for AlwaysReady {
    fn requires_peers(&self) -> bool {
        false
    }
    fn has_peers(&self) -> bool {
        true
    }
    fn in_sync(&self) -> bool {
        true
    }
}

/// Per-notary eligibility data from `komodo_eligiblenotary` (§4.6 step
/// 4): the last 65 miner ids and their block times, most recent first.
#[derive(Debug, Clone, Default)]
pub struct EligibleNotaryData {
    pub recent_miner_ids: Vec<u8>,
    pub block_times: Vec<u32>,
}

impl EligibleNotaryData {
    fn contains_miner(&self, notary_id: u8) -> bool {
        self.recent_miner_ids.contains(&notary_id)
    }
}

/// This node's notary identity and the hard-fork gates that change how
/// the difficulty windows apply.
#[derive(Debug, Clone)]
pub struct MiningIdentity {
    pub notary_id: Option<u8>,
    pub is_notary: bool,
    pub hf22_active: bool,
    pub max_future_block_time: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("template build failed: {0}")]
    Template(#[from] TemplateError),
    #[error("solver error: {0}")]
    Solver(#[from] SolverError),
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}

/// Applies the easy-mine and HF22 second-block relaxations to `bits`,
/// returning the possibly-reduced target (§4.6 step 4).
#[allow(clippy::too_many_arguments)]
pub fn apply_difficulty_windows(
    bits: u32,
    identity: &MiningIdentity,
    mining_height: u32,
    eligible: &EligibleNotaryData,
    tip_time: u32,
    block_time: u32,
    komodo_lastmined: u32,
    komodo_maybemined: u32,
) -> u32 {
    let Some(notary_id) = identity.notary_id else {
        return bits;
    };
    if !eligible.contains_miner(notary_id)
        && mining_height > komodo_lastmined + 64
        && mining_height > komodo_maybemined + 1
    {
        return KOMODO_MINDIFF_NBITS;
    }
    if identity.hf22_active
        && block_time >= tip_time + identity.max_future_block_time + 1
        && eligible.block_times.get(1) == Some(&tip_time)
        && is_second_block_allowed(notary_id, &eligible.recent_miner_ids)
    {
        return KOMODO_MINDIFF_NBITS;
    }
    bits
}

/// Stand-in for the external `isSecondBlockAllowed`: builds the
/// rotate-to-back priority list (ids 0..63 with the most recent miners
/// pushed to the tail) and admits `notary_id` once it sits ahead of the
/// rotated block (§4.6 step 4).
fn is_second_block_allowed(notary_id: u8, recent_miner_ids: &[u8]) -> bool {
    let mut priority: Vec<u8> = (0..64u8)
        .filter(|id| !recent_miner_ids.contains(id))
        .collect();
    priority.extend(recent_miner_ids.iter().copied());
    match priority.iter().position(|id| *id == notary_id) {
        Some(pos) => pos < priority.len().saturating_sub(recent_miner_ids.len()),
        None => false,
    }
}

/// Blocks until `block_time` is no longer further than `future_max`
/// seconds ahead of wall clock, polling once a second and bailing out
/// if `still_eligible` reports the chain moved on (§4.6 "Eligibility
/// helper").
pub fn wait_until_eligible(
    block_time: u32,
    future_max: u32,
    now: impl Fn() -> u32,
    still_eligible: impl Fn() -> bool,
    cancel: &CancelToken,
) -> bool {
    loop {
        if cancel.is_cancelled() || !still_eligible() {
            return false;
        }
        if block_time.saturating_sub(future_max) <= now() {
            return true;
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// Everything [`valid_block`] needs beyond the header/solution pair
/// itself: the target, whether this is a notary submission subject to
/// the future-time rule, and the stake-mode PoW ceiling.
pub struct ValidBlockArgs<'a> {
    pub is_komodo_notary: bool,
    pub block_time: u32,
    pub stake_pow_target: Option<u32>,
    pub now: &'a dyn Fn() -> u32,
    pub tip_advanced: &'a dyn Fn() -> bool,
}

fn solved_header(base: &BlockHeader, solution: &Solution) -> BlockHeader {
    let mut header = base.clone();
    header.nonce = u32::from_le_bytes(solution.nonce[0..4].try_into().unwrap());
    header.solution = solution.bytes.clone();
    header
}

/// The `validBlock` callback (§4.6 step 7): checks the found nonce
/// against the target, the stake PoS/PoW split, and the KMD future-time
/// rule.
pub fn valid_block(
    args: &ValidBlockArgs,
    base_header: &BlockHeader,
    solution: &Solution,
) -> Result<bool, ConsensusError> {
    let header = solved_header(base_header, solution);
    if !check_pow(&header)? {
        return Ok(false);
    }
    if let Some(pow_bits) = args.stake_pow_target {
        let mut pow_header = header.clone();
        pow_header.bits = pow_bits;
        if check_pow(&pow_header)? {
            // the PoS candidate also clears the PoW target: consensus
            // rejects a block that could have been mined honestly.
            return Ok(false);
        }
    }
    if args.is_komodo_notary {
        loop {
            if (args.now)() + 2 >= args.block_time {
                break;
            }
            if (args.tip_advanced)() {
                return Ok(false);
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(true)
}

/// Runs one mining worker thread to completion, rebuilding a template
/// each iteration of the outer loop until `shutdown` is observed (§4.6).
/// Generic over the solver back-end so production wiring and tests can
/// plug in different ones without changing the loop.
#[allow(clippy::too_many_arguments)]
pub fn run_worker<S: SolverBackend, V: UtxoViewMut + Send>(
    thread_index: usize,
    shutdown: &AtomicBool,
    state: &GlobalMiningState,
    peer_gate: &dyn PeerGate,
    solver: &S,
    cancel: &CancelToken,
    consensus: &dyn ConsensusParams,
    builder_config: BuilderConfig,
    mempool: &dyn MempoolView,
    view: &Mutex<V>,
    identity: &MiningIdentity,
    eligible: &EligibleNotaryData,
    tip_time: u32,
    stake_pow_bits: Option<u32>,
    mut next_context: impl FnMut(u32) -> BuildContext,
    mut submit: impl FnMut(&komodo_consensus::Block) -> bool,
) -> Result<(), DriverError> {
    let builder = TemplateBuilder::new(builder_config, consensus);
    while !shutdown.load(AtomicOrdering::SeqCst) {
        if peer_gate.requires_peers() && (!peer_gate.has_peers() || !peer_gate.in_sync()) {
            log::debug!("worker {thread_index}: waiting for peers");
            thread::sleep(Duration::from_millis(
                1000 + (thread_index as u64 % 5) * 800,
            ));
            continue;
        }

        let mining_height = state.mining_height.load(AtomicOrdering::SeqCst) + 1;
        let mut ctx = next_context(mining_height);
        ctx.bits = apply_difficulty_windows(
            ctx.bits,
            identity,
            mining_height,
            eligible,
            tip_time,
            ctx.block_time,
            state.komodo_lastmined.load(AtomicOrdering::SeqCst),
            state.komodo_maybemined.load(AtomicOrdering::SeqCst),
        );

        let template = {
            let mut guard = view.lock();
            match builder.build(mempool, &mut *guard, &ctx) {
                Ok(t) => t,
                Err(err) => {
                    log::warn!("worker {thread_index}: template build failed: {err}");
                    thread::sleep(Duration::from_millis(200));
                    continue;
                }
            }
        };
        state
            .mining_height
            .store(mining_height, AtomicOrdering::SeqCst);
        log::info!(
            "worker {thread_index}: rebuilt template at height {mining_height} with {} txs",
            template.block.txs.len()
        );

        let base_header = template.block.header.clone();
        let preimage = header_preimage(&base_header);
        let mut found: Option<Solution> = None;
        let solve_result = solver.solve(&preimage, cancel, &mut |solution: Solution| {
            let valid_args = ValidBlockArgs {
                is_komodo_notary: ctx.is_notary
                    && consensus.features().kind == komodo_consensus::ChainKind::Komodo,
                block_time: ctx.block_time,
                stake_pow_target: stake_pow_bits,
                now: &|| ctx.block_time,
                tip_advanced: &|| state.take_tip_changed(),
            };
            match valid_block(&valid_args, &base_header, &solution) {
                Ok(true) => {
                    found = Some(solution);
                    true
                }
                _ => false,
            }
        });

        match solve_result? {
            SolveOutcome::Accepted => {
                let Some(solution) = found else {
                    continue;
                };
                let mut block = template.block;
                block.header = solved_header(&base_header, &solution);
                if submit(&block) {
                    state
                        .komodo_lastmined
                        .store(mining_height, AtomicOrdering::SeqCst);
                    log::info!("worker {thread_index}: submitted block at height {mining_height}");
                    return Ok(());
                }
                log::debug!("worker {thread_index}: submission rejected, rebuilding");
            }
            SolveOutcome::Cancelled => {
                log::debug!("worker {thread_index}: cancelled, rebuilding");
            }
            SolveOutcome::Exhausted => {
                log::debug!("worker {thread_index}: exhausted search space, rebuilding");
            }
        }
    }
    Ok(())
}

/// Bytes the solver seeds its search with: the header up to but not
/// including nonce and solution (§4.6 step 6).
fn header_preimage(header: &BlockHeader) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 32 + 32 + 4 + 4);
    bytes.extend_from_slice(&header.version.to_le_bytes());
    bytes.extend_from_slice(&header.prev_block_hash);
    bytes.extend_from_slice(&header.merkle_root);
    bytes.extend_from_slice(&header.time.to_le_bytes());
    bytes.extend_from_slice(&header.bits.to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(notary_id: Option<u8>, hf22: bool) -> MiningIdentity {
        MiningIdentity {
            notary_id,
            is_notary: notary_id.is_some(),
            hf22_active: hf22,
            max_future_block_time: 60,
        }
    }

    #[test]
    fn non_notary_keeps_standard_bits() {
        let bits = apply_difficulty_windows(
            0x1e0fffff,
            &identity(None, false),
            100,
            &EligibleNotaryData::default(),
            1_000,
            1_001,
            0,
            0,
        );
        assert_eq!(bits, 0x1e0fffff);
    }

    #[test]
    fn easy_mine_window_kicks_in_past_lastmined_gap() {
        let eligible = EligibleNotaryData {
            recent_miner_ids: vec![1, 2, 3],
            block_times: vec![900, 800],
        };
        let bits = apply_difficulty_windows(
            0x1e0fffff,
            &identity(Some(7), false),
            200,
            &eligible,
            1_000,
            1_001,
            100,
            50,
        );
        assert_eq!(bits, KOMODO_MINDIFF_NBITS);
    }

    #[test]
    fn recent_miner_does_not_get_easy_mine() {
        let eligible = EligibleNotaryData {
            recent_miner_ids: vec![7, 2, 3],
            block_times: vec![900, 800],
        };
        let bits = apply_difficulty_windows(
            0x1e0fffff,
            &identity(Some(7), false),
            200,
            &eligible,
            1_000,
            1_001,
            100,
            50,
        );
        assert_eq!(bits, 0x1e0fffff);
    }

    #[test]
    fn wait_until_eligible_returns_once_wall_clock_catches_up() {
        let cancel = CancelToken::new();
        let wall_clock = std::cell::Cell::new(1_050u32);
        let ready = wait_until_eligible(
            1_100,
            60,
            || {
                wall_clock.set(wall_clock.get() + 10);
                wall_clock.get()
            },
            || true,
            &cancel,
        );
        assert!(ready);
    }

    #[test]
    fn wait_until_eligible_bails_when_no_longer_eligible() {
        let cancel = CancelToken::new();
        let ready = wait_until_eligible(10_000, 0, || 0, || false, &cancel);
        assert!(!ready);
    }

    #[test]
    fn valid_block_rejects_below_target() {
        let header = BlockHeader {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [1u8; 32],
            time: 0,
            bits: 0x03000000, // an effectively unreachable target
            nonce: 0,
            solution: vec![],
        };
        let args = ValidBlockArgs {
            is_komodo_notary: false,
            block_time: 0,
            stake_pow_target: None,
            now: &|| 0,
            tip_advanced: &|| false,
        };
        let solution = Solution {
            nonce: [0u8; 32],
            bytes: vec![1, 2, 3],
        };
        assert!(!valid_block(&args, &header, &solution).unwrap());
    }

    #[test]
    fn valid_block_accepts_easy_target() {
        let header = BlockHeader {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [1u8; 32],
            time: 0,
            bits: 0x207fffff,
            nonce: 0,
            solution: vec![],
        };
        let args = ValidBlockArgs {
            is_komodo_notary: false,
            block_time: 0,
            stake_pow_target: None,
            now: &|| 0,
            tip_advanced: &|| false,
        };
        let solution = Solution {
            nonce: [0u8; 32],
            bytes: vec![1, 2, 3],
        };
        assert!(valid_block(&args, &header, &solution).unwrap());
    }
}
