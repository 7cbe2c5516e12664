//! Notarisation detection (C3): recognizing the single transaction per
//! block that records a cross-chain checkpoint signed by the active
//! notary set, and enforcing the at-most-one-per-block rule.

use komodo_consensus::NotarySet;
use komodo_utxo::{script, Coin, Transaction, UtxoView};

/// Result of scoring one transaction's inputs against the active notary
/// set (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotarySignerOutcome {
    /// Not a candidate: too few distinct notary signers.
    InsufficientSigners { signers: usize, threshold: usize },
    /// Two inputs were signed by the same notary — degrade to an
    /// ordinary transaction rather than reject it outright.
    DuplicateSigner,
    /// Enough distinct notary signers; still needs the OP_RETURN shape
    /// check before being accepted as a notarisation.
    Qualifies { signers: usize },
}

/// Counts distinct notary signers among `tx`'s inputs by matching each
/// spent coin's scriptPubKey against the push33-OP_CHECKSIG template and
/// looking the pubkey up in `notaries`.
pub fn score_notary_signers(
    tx: &Transaction,
    view: &dyn UtxoView,
    notaries: &NotarySet,
) -> NotarySignerOutcome {
    let mut signers: Vec<Vec<u8>> = Vec::new();
    for vin in &tx.vin {
        let Some(Coin { txout, .. }) = view.access_coin(&vin.prevout) else {
            continue;
        };
        if let Some(pubkey) = script::match_push33_checksig(&txout.script_pubkey) {
            if notaries.contains(pubkey) && !signers.iter().any(|s| s.as_slice() == pubkey) {
                signers.push(pubkey.to_vec());
            } else if notaries.contains(pubkey) {
                return NotarySignerOutcome::DuplicateSigner;
            }
        }
    }
    let threshold = notaries.threshold();
    if signers.len() >= threshold {
        NotarySignerOutcome::Qualifies {
            signers: signers.len(),
        }
    } else {
        NotarySignerOutcome::InsufficientSigners {
            signers: signers.len(),
            threshold,
        }
    }
}

/// Checks the trailing-OP_RETURN shape a notarisation must carry:
/// exactly two outputs, the second worth zero and opening with
/// `OP_RETURN`, whose payload decodes to a non-zero notarized height.
pub fn has_notarisation_shape(
    tx: &Transaction,
    extract_notarized_height: impl Fn(&[u8]) -> u32,
) -> bool {
    if tx.vout.len() != 2 {
        return false;
    }
    let op_return = &tx.vout[1];
    if op_return.value != 0 {
        return false;
    }
    if !script::is_op_return(&op_return.script_pubkey) {
        return false;
    }
    extract_notarized_height(&op_return.script_pubkey) != 0
}

/// Enforces the at-most-one-notarisation-per-block rule across a single
/// scoring pass (§4.3). The first transaction admitted as a notarisation
/// claims position 1; any later candidate is dropped back to ordinary
/// scoring.
#[derive(Debug, Default)]
pub struct NotarisationSlot {
    claimed: Option<[u8; 32]>,
}

impl NotarisationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.is_some()
    }

    pub fn claimed_txid(&self) -> Option<[u8; 32]> {
        self.claimed
    }

    /// Attempts to claim the slot for `txid`. Returns `true` on success
    /// (this is now the block's notarisation); `false` if another
    /// transaction already claimed it this pass.
    pub fn try_claim(&mut self, txid: [u8; 32]) -> bool {
        if self.claimed.is_some() {
            return false;
        }
        self.claimed = Some(txid);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use komodo_consensus::NotaryPubkey;
    use komodo_utxo::{InMemoryUtxoView, OutPoint, TxIn, TxOut};

    fn tx_with_inputs(inputs: Vec<OutPoint>) -> Transaction {
        Transaction {
            version: 1,
            vin: inputs
                .into_iter()
                .map(|prevout| TxIn {
                    prevout,
                    script_sig: vec![],
                    sequence: 0xffff_ffff,
                })
                .collect(),
            vout: vec![
                TxOut {
                    value: 0,
                    script_pubkey: vec![],
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![script::OP_RETURN, 4, 0, 0, 0, 42],
                },
            ],
            lock_time: 0,
            expiry_height: 0,
            shielded_spends: vec![],
            shielded_outputs: vec![],
            joinsplits: vec![],
            is_coinbase: false,
        }
    }

    #[test]
    fn thirteen_of_sixty_four_qualifies() {
        let keys: Vec<NotaryPubkey> = (0..64).map(|i| [i as u8; 33]).collect();
        let notaries = NotarySet::new(keys.clone()).unwrap();
        let mut view = InMemoryUtxoView::new();
        let mut outpoints = Vec::new();
        for i in 0..13u8 {
            let outpoint = OutPoint {
                txid: [100 + i; 32],
                vout: 0,
            };
            let mut script_pubkey = vec![script::OP_PUSH33];
            script_pubkey.extend(keys[i as usize]);
            script_pubkey.push(script::OP_CHECKSIG);
            view.insert(
                outpoint,
                Coin {
                    txout: TxOut {
                        value: 1,
                        script_pubkey,
                    },
                    height: 1,
                    is_coinbase: false,
                },
            );
            outpoints.push(outpoint);
        }
        let tx = tx_with_inputs(outpoints);
        let outcome = score_notary_signers(&tx, &view, &notaries);
        assert_eq!(outcome, NotarySignerOutcome::Qualifies { signers: 13 });
        assert!(has_notarisation_shape(&tx, |bytes| u32::from_le_bytes(
            bytes[1..5].try_into().unwrap()
        )));
    }

    #[test]
    fn duplicate_signer_degrades_to_ordinary() {
        let pubkey = [1u8; 33];
        let notaries = NotarySet::new(vec![pubkey]).unwrap();
        let op1 = OutPoint {
            txid: [1u8; 32],
            vout: 0,
        };
        let op2 = OutPoint {
            txid: [2u8; 32],
            vout: 0,
        };
        let mut script_pubkey = vec![script::OP_PUSH33];
        script_pubkey.extend(pubkey);
        script_pubkey.push(script::OP_CHECKSIG);
        let coin = Coin {
            txout: TxOut {
                value: 1,
                script_pubkey,
            },
            height: 1,
            is_coinbase: false,
        };
        let mut view = InMemoryUtxoView::new();
        view.insert(op1, coin.clone());
        view.insert(op2, coin);
        let tx = tx_with_inputs(vec![op1, op2]);
        let outcome = score_notary_signers(&tx, &view, &notaries);
        assert_eq!(outcome, NotarySignerOutcome::DuplicateSigner);
    }

    #[test]
    fn slot_grants_only_first_claim() {
        let mut slot = NotarisationSlot::new();
        assert!(slot.try_claim([1u8; 32]));
        assert!(!slot.try_claim([2u8; 32]));
        assert_eq!(slot.claimed_txid(), Some([1u8; 32]));
    }
}
