//! komodo-utxo
//!
//! Transaction and UTXO primitives shared by the consensus and mining
//! crates: the [`Transaction`] record, its canonical encoding and identity
//! hash, and the [`UtxoView`] contract the template builder reads and
//! speculatively writes while assembling a block (real UTXO storage,
//! script validation and consensus rules live outside this crate — see
//! SPEC_FULL.md §1).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

pub mod script;

/// Maximum allowed script size in bytes (DoS mitigation).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Maximum allowed number of inputs or outputs in a transaction.
pub const MAX_TX_INOUTS: usize = 10_000;
/// Below this, `lock_time` is interpreted as a block height; at or above,
/// as a unix timestamp (mirrors Bitcoin's `LOCKTIME_THRESHOLD`).
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// A `TxIn::sequence` of this value marks the input unconditionally final.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
/// Bytes charged per input that a script-sig byte count cannot reduce below,
/// when computing [`Transaction::modified_size`].
pub const PER_INPUT_OVERHEAD: usize = 41;
/// Cap on how many script-sig bytes are deducted per input.
pub const MAX_SCRIPTSIG_DEDUCTION: usize = 110;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// Placeholder for a Sapling shielded spend. The cryptographic fields
/// (nullifier, value commitment, proof) are opaque byte blobs here — the
/// shielded-pool circuit is outside this crate's scope; only its presence
/// and count matter to template assembly (Sapling anchor bookkeeping,
/// §4.4 step 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldedSpend {
    pub nullifier: [u8; 32],
    pub anchor: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldedOutput {
    pub commitment: [u8; 32],
}

/// Sprout joinsplit, kept only for value-balance bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSplit {
    pub vpub_old: u64,
    pub vpub_new: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
    pub expiry_height: u32,
    #[serde(default)]
    pub shielded_spends: Vec<ShieldedSpend>,
    #[serde(default)]
    pub shielded_outputs: Vec<ShieldedOutput>,
    #[serde(default)]
    pub joinsplits: Vec<JoinSplit>,
    #[serde(default)]
    pub is_coinbase: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum UtxoError {
    #[error("script too large: {0} bytes (max {1})")]
    TooLargeScript(usize, usize),
    #[error("too many inputs or outputs: {0} (max {1})")]
    TooManyInOut(usize, usize),
    #[error("overflow during summation")]
    Overflow,
    #[error("missing utxo: {0:?}")]
    MissingUtxo(OutPoint),
    #[error("value not conserved: input={input} output={output}")]
    ValueNotConserved { input: u64, output: u64 },
    #[error("duplicate input: {0:?}")]
    DuplicateInput(OutPoint),
    #[error("duplicate output: {0:?}")]
    DuplicateOutput(OutPoint),
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl Transaction {
    pub fn validate(&self) -> Result<(), UtxoError> {
        if self.vin.len() > MAX_TX_INOUTS {
            return Err(UtxoError::TooManyInOut(self.vin.len(), MAX_TX_INOUTS));
        }
        if self.vout.len() > MAX_TX_INOUTS {
            return Err(UtxoError::TooManyInOut(self.vout.len(), MAX_TX_INOUTS));
        }
        for input in &self.vin {
            if input.script_sig.len() > MAX_SCRIPT_SIZE {
                return Err(UtxoError::TooLargeScript(
                    input.script_sig.len(),
                    MAX_SCRIPT_SIZE,
                ));
            }
        }
        for output in &self.vout {
            if output.script_pubkey.len() > MAX_SCRIPT_SIZE {
                return Err(UtxoError::TooLargeScript(
                    output.script_pubkey.len(),
                    MAX_SCRIPT_SIZE,
                ));
            }
        }
        Ok(())
    }

    /// Canonical, deterministic little-endian encoding used for both the
    /// identity hash and the "serialized size" budget in §3/§4.4.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, UtxoError> {
        self.validate()?;
        let mut out = Vec::new();
        out.extend(&self.version.to_le_bytes());
        out.extend(&(self.vin.len() as u64).to_le_bytes());
        for vin in &self.vin {
            out.extend(&vin.prevout.txid);
            out.extend(&vin.prevout.vout.to_le_bytes());
            out.extend(&(vin.script_sig.len() as u64).to_le_bytes());
            out.extend(&vin.script_sig);
            out.extend(&vin.sequence.to_le_bytes());
        }
        out.extend(&(self.vout.len() as u64).to_le_bytes());
        for vout in &self.vout {
            out.extend(&vout.value.to_le_bytes());
            out.extend(&(vout.script_pubkey.len() as u64).to_le_bytes());
            out.extend(&vout.script_pubkey);
        }
        out.extend(&self.lock_time.to_le_bytes());
        out.extend(&self.expiry_height.to_le_bytes());
        out.extend(&(self.shielded_spends.len() as u64).to_le_bytes());
        for spend in &self.shielded_spends {
            out.extend(&spend.nullifier);
            out.extend(&spend.anchor);
        }
        out.extend(&(self.shielded_outputs.len() as u64).to_le_bytes());
        for output in &self.shielded_outputs {
            out.extend(&output.commitment);
        }
        out.extend(&(self.joinsplits.len() as u64).to_le_bytes());
        for js in &self.joinsplits {
            out.extend(&js.vpub_old.to_le_bytes());
            out.extend(&js.vpub_new.to_le_bytes());
        }
        out.push(self.is_coinbase as u8);
        Ok(out)
    }

    /// Stable identity hash: double-SHA256 of the canonical encoding.
    /// Nothing in this crate mutates a `Transaction` after its txid has
    /// been read.
    pub fn txid(&self) -> Result<[u8; 32], UtxoError> {
        let bytes = self.canonical_bytes()?;
        let first = Sha256::digest(&bytes);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Ok(out)
    }

    pub fn serialized_size(&self) -> Result<usize, UtxoError> {
        Ok(self.canonical_bytes()?.len())
    }

    /// `serialized_size - sum(41 + min(110, scriptSig_len))` per input —
    /// the "modified size" priority divides by (§3, GLOSSARY).
    pub fn modified_size(&self) -> Result<usize, UtxoError> {
        let size = self.serialized_size()?;
        let deduction: usize = self
            .vin
            .iter()
            .map(|vin| PER_INPUT_OVERHEAD + vin.script_sig.len().min(MAX_SCRIPTSIG_DEDUCTION))
            .sum();
        Ok(size.saturating_sub(deduction).max(1))
    }

    /// Heuristic legacy sigop count. A full script interpreter is out of
    /// scope (§1); this counts `OP_CHECKSIG`/`OP_CHECKSIGVERIFY` as one
    /// sigop and `OP_CHECKMULTISIG`/`OP_CHECKMULTISIGVERIFY` as
    /// [`script::MULTISIG_SIGOP_COUNT`] each, scanning both scriptSig and
    /// scriptPubKey — enough to drive the block sigop budget without
    /// interpreting P2SH redeem scripts.
    pub fn sigop_count(&self) -> usize {
        let mut total = 0usize;
        for vin in &self.vin {
            total += script::count_sigops(&vin.script_sig);
        }
        for vout in &self.vout {
            total += script::count_sigops(&vout.script_pubkey);
        }
        total
    }

    pub fn value_out(&self) -> Result<u64, UtxoError> {
        let mut sum: u64 = 0;
        for out in &self.vout {
            sum = sum.checked_add(out.value).ok_or(UtxoError::Overflow)?;
        }
        Ok(sum)
    }

    /// `IsFinalTx`: final if lock_time is zero, if every input carries
    /// `SEQUENCE_FINAL`, or if lock_time has already passed `cutoff`
    /// (a height or a time, matching `lock_time`'s own threshold).
    pub fn is_final(&self, height: u32, cutoff: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff_is_height = self.lock_time < LOCKTIME_THRESHOLD;
        let reference = if cutoff_is_height { height } else { cutoff };
        if self.lock_time < reference {
            return true;
        }
        self.vin.iter().all(|vin| vin.sequence == SEQUENCE_FINAL)
    }

    pub fn is_expired(&self, height: u32) -> bool {
        self.expiry_height != 0 && height > self.expiry_height
    }

    pub fn has_duplicate_inputs(&self) -> Option<OutPoint> {
        let mut seen: HashSet<OutPoint> = HashSet::new();
        for vin in &self.vin {
            if !seen.insert(vin.prevout) {
                return Some(vin.prevout);
            }
        }
        None
    }

    pub fn make_outpoints(&self) -> Result<Vec<OutPoint>, UtxoError> {
        let txid = self.txid()?;
        Ok((0..self.vout.len() as u32)
            .map(|vout| OutPoint { txid, vout })
            .collect())
    }
}

/// A coin sitting in the UTXO set: the output itself plus the height it
/// was confirmed at and whether it came from a coinbase (maturity rules
/// over coinbase coins are a consensus concern and out of scope here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub txout: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

/// Read contract for the external UTXO view (§6): "has coins?",
/// "access coins", and "value-in with any accrued interest". Real
/// implementations back this with the node's chainstate; this crate only
/// defines the contract plus [`InMemoryUtxoView`], a reference stand-in
/// used in tests.
pub trait UtxoView {
    fn has_coin(&self, outpoint: &OutPoint) -> bool;
    fn access_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// Sum of input values plus any chain-specific interest accrual.
    /// Interest is a Komodo-specific rule; generic views return zero.
    fn get_value_in(&self, tx: &Transaction) -> Result<(u64, u64), UtxoError> {
        let mut total = 0u64;
        for vin in &tx.vin {
            let coin = self
                .access_coin(&vin.prevout)
                .ok_or(UtxoError::MissingUtxo(vin.prevout))?;
            total = total
                .checked_add(coin.txout.value)
                .ok_or(UtxoError::Overflow)?;
        }
        Ok((total, 0))
    }
}

/// Write contract: applying a transaction's effects into the view. Split
/// from [`UtxoView`] because the template builder is the only caller that
/// needs to mutate a view (to layer speculative spends, §3/§4.4), while
/// scoring-only callers (the notarisation detector, coinbase composer)
/// only ever read.
pub trait UtxoViewMut: UtxoView {
    fn update_coins(&mut self, tx: &Transaction, height: u32) -> Result<(), UtxoError>;
}

/// In-memory reference implementation of [`UtxoView`]/[`UtxoViewMut`],
/// used by tests throughout this workspace in place of the real chainstate.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUtxoView {
    map: HashMap<OutPoint, Coin>,
}

impl InMemoryUtxoView {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, outpoint: OutPoint, coin: Coin) {
        self.map.insert(outpoint, coin);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        self.map.remove(outpoint)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl UtxoView for InMemoryUtxoView {
    fn has_coin(&self, outpoint: &OutPoint) -> bool {
        self.map.contains_key(outpoint)
    }

    fn access_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.map.get(outpoint).cloned()
    }
}

impl UtxoViewMut for InMemoryUtxoView {
    fn update_coins(&mut self, tx: &Transaction, height: u32) -> Result<(), UtxoError> {
        if !tx.is_coinbase {
            for vin in &tx.vin {
                self.map
                    .remove(&vin.prevout)
                    .ok_or(UtxoError::MissingUtxo(vin.prevout))?;
            }
        }
        for (outpoint, txout) in tx.make_outpoints()?.into_iter().zip(tx.vout.iter()) {
            self.map.insert(
                outpoint,
                Coin {
                    txout: txout.clone(),
                    height,
                    is_coinbase: tx.is_coinbase,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tx(prev: OutPoint, value: u64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: prev,
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![4, 5, 6],
            }],
            lock_time: 0,
            expiry_height: 0,
            shielded_spends: vec![],
            shielded_outputs: vec![],
            joinsplits: vec![],
            is_coinbase: false,
        }
    }

    #[test]
    fn txid_is_deterministic() {
        let tx = make_tx(
            OutPoint {
                txid: [9u8; 32],
                vout: 0,
            },
            1_000,
        );
        assert_eq!(tx.txid().unwrap(), tx.txid().unwrap());
    }

    #[test]
    fn modified_size_deducts_scriptsig_with_cap() {
        let mut tx = make_tx(
            OutPoint {
                txid: [1u8; 32],
                vout: 0,
            },
            1_000,
        );
        let base = tx.serialized_size().unwrap();
        tx.vin[0].script_sig = vec![0u8; 200];
        let grown = tx.serialized_size().unwrap();
        assert!(grown > base);
        // Deduction caps at 110 bytes even though the scriptSig is 200 bytes.
        let modified = tx.modified_size().unwrap();
        assert_eq!(modified, grown.saturating_sub(41 + 110).max(1));
    }

    #[test]
    fn overflow_on_outputs() {
        let tx = Transaction {
            version: 1,
            vin: vec![],
            vout: vec![
                TxOut {
                    value: u64::MAX,
                    script_pubkey: vec![],
                },
                TxOut {
                    value: 1,
                    script_pubkey: vec![],
                },
            ],
            lock_time: 0,
            expiry_height: 0,
            shielded_spends: vec![],
            shielded_outputs: vec![],
            joinsplits: vec![],
            is_coinbase: false,
        };
        assert!(matches!(tx.value_out(), Err(UtxoError::Overflow)));
    }

    #[test]
    fn is_final_respects_sequence_and_height() {
        let mut tx = make_tx(
            OutPoint {
                txid: [2u8; 32],
                vout: 0,
            },
            10,
        );
        tx.lock_time = 100;
        assert!(!tx.is_final(50, 50));
        assert!(tx.is_final(150, 150));
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(50, 50));
    }

    #[test]
    fn is_expired_checks_expiry_height() {
        let mut tx = make_tx(
            OutPoint {
                txid: [3u8; 32],
                vout: 0,
            },
            10,
        );
        tx.expiry_height = 100;
        assert!(!tx.is_expired(100));
        assert!(tx.is_expired(101));
        tx.expiry_height = 0;
        assert!(!tx.is_expired(u32::MAX));
    }

    #[test]
    fn update_coins_layers_spend_then_create() {
        let mut view = InMemoryUtxoView::new();
        let in_op = OutPoint {
            txid: [5u8; 32],
            vout: 0,
        };
        view.insert(
            in_op,
            Coin {
                txout: TxOut {
                    value: 100,
                    script_pubkey: vec![],
                },
                height: 1,
                is_coinbase: false,
            },
        );
        let tx = make_tx(in_op, 90);
        view.update_coins(&tx, 2).unwrap();
        assert!(!view.has_coin(&in_op));
        let outpoints = tx.make_outpoints().unwrap();
        assert!(view.has_coin(&outpoints[0]));
    }

    #[test]
    fn duplicate_input_detected() {
        let op = OutPoint {
            txid: [4u8; 32],
            vout: 0,
        };
        let tx = Transaction {
            version: 1,
            vin: vec![
                TxIn {
                    prevout: op,
                    script_sig: vec![],
                    sequence: 0,
                },
                TxIn {
                    prevout: op,
                    script_sig: vec![],
                    sequence: 0,
                },
            ],
            vout: vec![],
            lock_time: 0,
            expiry_height: 0,
            shielded_spends: vec![],
            shielded_outputs: vec![],
            joinsplits: vec![],
            is_coinbase: false,
        };
        assert_eq!(tx.has_duplicate_inputs(), Some(op));
    }
}
