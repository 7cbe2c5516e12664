//! komodo-consensus
//!
//! Block header and proof-of-work primitives, plus the narrow contracts
//! (`ConsensusParams`, `NotaryOracle`, `BlockValidator`) the mining crate
//! treats as external collaborators rather than reimplementing. Full
//! consensus validation, chain selection and notary election all live
//! outside this crate (see SPEC_FULL.md §1) — what's here is just enough
//! for the template builder and mining driver to ask "what are the rules
//! right now" and "did this block already pass validation".

use komodo_utxo::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cap on notary set size, mirroring `notarypubkeys[64][33]` in the
/// original C implementation — every consumer downstream assumes this
/// bound, so it is kept explicit rather than growing unbounded.
pub const MAX_NOTARIES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Solution bytes from the external Equihash solver (component C7);
    /// empty until a solver fills it in. Not interpreted by this crate.
    #[serde(default)]
    pub solution: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn new(
        version: i32,
        prev_block_hash: [u8; 32],
        time: u32,
        bits: u32,
        nonce: u32,
        txs: Vec<Transaction>,
    ) -> Result<Self, ConsensusError> {
        let txids = txs
            .iter()
            .map(|tx| tx.txid())
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConsensusError::Utxo)?;
        let merkle_root = merkle_root(&txids);
        Ok(Block {
            header: BlockHeader {
                version,
                prev_block_hash,
                merkle_root,
                time,
                bits,
                nonce,
                solution: Vec::new(),
            },
            txs,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("UTXO error: {0}")]
    Utxo(#[from] komodo_utxo::UtxoError),
    #[error("invalid bits")]
    InvalidBits,
    #[error("too many notaries: {0} (max {1})")]
    TooManyNotaries(usize, usize),
}

pub fn header_hash(header: &BlockHeader) -> [u8; 32] {
    let mut bytes = Vec::with_capacity(4 + 32 + 32 + 4 + 4 + 4);
    bytes.extend_from_slice(&header.version.to_le_bytes());
    bytes.extend_from_slice(&header.prev_block_hash);
    bytes.extend_from_slice(&header.merkle_root);
    bytes.extend_from_slice(&header.time.to_le_bytes());
    bytes.extend_from_slice(&header.bits.to_le_bytes());
    bytes.extend_from_slice(&header.nonce.to_le_bytes());
    bytes.extend_from_slice(&header.solution);
    let first = Sha256::digest(&bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn bits_to_target(bits: u32) -> Result<[u8; 32], ConsensusError> {
    if bits == 0 {
        return Err(ConsensusError::InvalidBits);
    }
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 {
        return Err(ConsensusError::InvalidBits);
    }

    let mut target = [0u8; 32];
    if exponent <= 3 {
        let shift = 8 * (3 - exponent);
        let value = mantissa >> shift;
        let bytes = value.to_be_bytes();
        let start = 32 - exponent as usize;
        let copy_start = 4 - exponent as usize;
        target[start..].copy_from_slice(&bytes[copy_start..]);
    } else {
        let start = 32usize
            .checked_sub(exponent as usize)
            .ok_or(ConsensusError::InvalidBits)?;
        if start + 3 > 32 {
            return Err(ConsensusError::InvalidBits);
        }
        let mantissa_bytes = [
            ((mantissa >> 16) & 0xff) as u8,
            ((mantissa >> 8) & 0xff) as u8,
            (mantissa & 0xff) as u8,
        ];
        target[start..start + 3].copy_from_slice(&mantissa_bytes);
    }
    Ok(target)
}

pub fn check_pow(header: &BlockHeader) -> Result<bool, ConsensusError> {
    let target = bits_to_target(header.bits)?;
    let hash = header_hash(header);
    Ok(hash_leq(&hash, &target))
}

/// Brute-force nonce search, kept for tests and for chains small enough
/// that a real Equihash solver (C7) isn't worth wiring up. The mining
/// driver calls into a `SolverBackend` instead of this function.
pub fn mine_header(
    header: &mut BlockHeader,
    max_nonce: u32,
) -> Result<Option<u32>, ConsensusError> {
    for _ in 0..=max_nonce {
        if check_pow(header)? {
            return Ok(Some(header.nonce));
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
    Ok(None)
}

fn hash_leq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    for i in 0..32 {
        if a[i] < b[i] {
            return true;
        }
        if a[i] > b[i] {
            return false;
        }
    }
    true
}

pub fn merkle_root(txids: &[[u8; 32]]) -> [u8; 32] {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut i = 0;
        while i < level.len() {
            let left = level[i];
            let right = if i + 1 < level.len() {
                level[i + 1]
            } else {
                level[i]
            };
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            let first = Sha256::digest(&data);
            let second = Sha256::digest(first);
            let mut out = [0u8; 32];
            out.copy_from_slice(&second);
            next.push(out);
            i += 2;
        }
        level = next;
    }
    level[0]
}

/// Discriminates the Komodo chain proper from sibling notary-pay/adaptive
/// PoW chains that share most of its code paths. Interest validation
/// (`komodo_validate_interest` in the original) is gated on this, not on
/// a generic feature flag, since no chain other than literal KMD has ever
/// enabled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Komodo,
    NotaryPay,
    AdaptivePow,
    Generic,
}

/// Per-chain feature toggles and constants read by the template builder
/// and coinbase composer (§6). Mirrors the `ASSETCHAINS_*` global flags
/// and thresholds in the original, collected into one struct instead of
/// scattered statics.
#[derive(Debug, Clone, Copy)]
pub struct ChainFeatures {
    pub kind: ChainKind,
    /// Notarisation-signer pay split is active once this block contains
    /// a qualifying notarisation (§4.5 "NotaryPay" variant).
    pub notary_pay: bool,
    /// Proof-of-stake block composition is active (§4.4 step 8, §4.5
    /// "Stake" variant); mutually exclusive with the Komodo notary-vin
    /// path, since only non-KMD chains stake.
    pub staked: bool,
    /// Fraction of a staked block's stake value skimmed into coinbase
    /// fees rather than returned to the staker.
    pub stake_split_percent: f64,
    pub timelock_coinbase: bool,
    /// Coinbase outputs at or above this value get wrapped in a CLTV
    /// timelock (§4.5 "Timelock" variant). Only consulted when
    /// `timelock_coinbase` is set.
    pub timelock_threshold: u64,
    pub commission_enabled: bool,
    /// Fraction of the subsidy diverted to `commission_pubkey` (§4.5
    /// "Commission/founders' reward" variant).
    pub commission_percent: f64,
    pub commission_pubkey: Option<[u8; 33]>,
    /// Height at which KMD fee-burn activates (`nKIP0003Activation`).
    /// `None` means fee-burn never activates on this chain.
    pub fee_burn_activation_height: Option<u32>,
}

impl ChainFeatures {
    pub fn komodo() -> Self {
        ChainFeatures {
            kind: ChainKind::Komodo,
            notary_pay: false,
            staked: false,
            stake_split_percent: 0.0,
            timelock_coinbase: false,
            timelock_threshold: 0,
            commission_enabled: false,
            commission_percent: 0.0,
            commission_pubkey: None,
            fee_burn_activation_height: None,
        }
    }

    pub fn validates_interest(&self) -> bool {
        matches!(self.kind, ChainKind::Komodo)
    }

    pub fn fee_burn_active_at(&self, height: u32) -> bool {
        matches!(self.kind, ChainKind::Komodo)
            && self
                .fee_burn_activation_height
                .is_some_and(|activation| height >= activation)
    }
}

/// Consensus-parameter contract the mining crate reads from rather than
/// hardcoding: block size/sigop limits, subsidy schedule, and chain
/// features. A real node backs this with its loaded chain params; tests
/// use [`StaticConsensusParams`].
pub trait ConsensusParams {
    fn max_block_size(&self) -> usize;
    fn max_block_sigops(&self) -> usize;
    fn coinbase_maturity(&self) -> u32;
    fn subsidy(&self, height: u32) -> u64;
    fn features(&self) -> ChainFeatures;
}

#[derive(Debug, Clone)]
pub struct StaticConsensusParams {
    pub max_block_size: usize,
    pub max_block_sigops: usize,
    pub coinbase_maturity: u32,
    pub base_subsidy: u64,
    pub halving_interval: u32,
    pub features: ChainFeatures,
}

impl Default for StaticConsensusParams {
    fn default() -> Self {
        StaticConsensusParams {
            max_block_size: 2_000_000,
            max_block_sigops: 20_000,
            coinbase_maturity: 100,
            base_subsidy: 300_000_000,
            halving_interval: 840_000,
            features: ChainFeatures::komodo(),
        }
    }
}

impl ConsensusParams for StaticConsensusParams {
    fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    fn max_block_sigops(&self) -> usize {
        self.max_block_sigops
    }

    fn coinbase_maturity(&self) -> u32 {
        self.coinbase_maturity
    }

    fn subsidy(&self, height: u32) -> u64 {
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            0
        } else {
            self.base_subsidy >> halvings
        }
    }

    fn features(&self) -> ChainFeatures {
        self.features
    }
}

/// A notary's signing pubkey (compressed, 33 bytes) active at some height.
pub type NotaryPubkey = [u8; 33];

/// The active notary set, capped at [`MAX_NOTARIES`] as the original
/// fixed-size `notarypubkeys` array is.
#[derive(Debug, Clone, Default)]
pub struct NotarySet {
    keys: Vec<NotaryPubkey>,
}

impl NotarySet {
    pub fn new(keys: Vec<NotaryPubkey>) -> Result<Self, ConsensusError> {
        if keys.len() > MAX_NOTARIES {
            return Err(ConsensusError::TooManyNotaries(keys.len(), MAX_NOTARIES));
        }
        Ok(NotarySet { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.keys.iter().any(|k| k.as_slice() == key)
    }

    pub fn keys(&self) -> &[NotaryPubkey] {
        &self.keys
    }

    /// Signer threshold for a valid notarisation: `ceil(N / 5)`.
    pub fn threshold(&self) -> usize {
        (self.len() + 4) / 5
    }
}

/// Contract for asking "who are the active notaries at this height, and
/// how many signatures make a notarisation valid" — election itself
/// (reading the backing notarisation chain) is out of scope.
pub trait NotaryOracle {
    fn notaries_at(&self, height: u32) -> NotarySet;
}

/// Fixed reference oracle for tests: same notary set at every height.
#[derive(Debug, Clone)]
pub struct StaticNotaryOracle {
    pub set: NotarySet,
}

impl NotaryOracle for StaticNotaryOracle {
    fn notaries_at(&self, _height: u32) -> NotarySet {
        self.set.clone()
    }
}

/// Contract for "has this candidate block already been checked by full
/// validation". The template builder never runs consensus validation
/// itself (§1 Non-goals); it only asks this after assembling a candidate
/// in debug/test paths.
pub trait BlockValidator {
    fn check_block(&self, block: &Block) -> Result<(), ConsensusError>;
}

/// Stand-in validator that only checks proof-of-work, for tests that
/// don't need full consensus rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowOnlyValidator;

impl BlockValidator for PowOnlyValidator {
    fn check_block(&self, block: &Block) -> Result<(), ConsensusError> {
        if check_pow(&block.header)? {
            Ok(())
        } else {
            Err(ConsensusError::InvalidBits)
        }
    }
}
