//! Coinbase composition (C5): the base coinbase shape plus the KMD
//! fee-burn / notary-bonus / commission / timelock / notary-pay / stake
//! variants layered on top of it (§4.5).

use komodo_utxo::{OutPoint, Transaction, TxIn, TxOut};

pub const COINBASE_FLAGS: &[u8] = b"/komodo-miner/";
const NOTARY_BONUS_SATS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum CoinbaseError {
    #[error("notary-pay split computed to zero")]
    ZeroNotaryPaySplit,
    #[error("timelock wrap requires a non-P2SH, non-CC source script")]
    AlreadyWrapped,
    #[error("value overflow composing coinbase")]
    Overflow,
}

/// Inputs the composer needs beyond the raw subsidy/fee numbers — kept
/// as a struct instead of a long parameter list, mirroring how the
/// template builder already threads a `consensus parameters` handle
/// through C4.
#[derive(Debug, Clone)]
pub struct CoinbaseParams {
    pub height: u32,
    pub subsidy: u64,
    pub fees: u64,
    pub lock_time: u32,
    pub miner_script: Vec<u8>,
    pub is_notary: bool,
    pub fee_burn_active: bool,
    pub commission: Option<Commission>,
    pub timelock_threshold: Option<u64>,
    pub notary_pay_signers: Option<Vec<[u8; 33]>>,
}

#[derive(Debug, Clone)]
pub struct Commission {
    pub amount: u64,
    pub pay_to_pubkey: Option<[u8; 33]>,
    pub pay_to_script: Option<Vec<u8>>,
}

/// Height-and-counter encoded the way `scriptSig = (height, CScriptNum(1))
/// + COINBASE_FLAGS` is in the base form (§4.5).
fn coinbase_script_sig(height: u32, extra_nonce: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(height.to_le_bytes());
    out.extend(extra_nonce.to_le_bytes());
    out.extend(COINBASE_FLAGS);
    out
}

fn op_return_script(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![komodo_utxo::script::OP_RETURN];
    script.extend(payload);
    script
}

fn push33_checksig_script(pubkey: &[u8; 33]) -> Vec<u8> {
    let mut script = vec![komodo_utxo::script::OP_PUSH33];
    script.extend(pubkey);
    script.push(komodo_utxo::script::OP_CHECKSIG);
    script
}

/// Builds the base coinbase (§4.5 "Coinbase base form") with whichever
/// variants `params` selects layered on afterward in the order the
/// original applies them: fee-burn/notary-bonus, then
/// commission/notary-pay, then the timelock wrap last (it must see the
/// final vout[0] value to decide whether to wrap it).
pub fn compose_coinbase(params: &CoinbaseParams) -> Result<Transaction, CoinbaseError> {
    let mut paid_amount = params
        .subsidy
        .checked_add(params.fees)
        .ok_or(CoinbaseError::Overflow)?;
    if params.is_notary {
        paid_amount = paid_amount
            .checked_add(NOTARY_BONUS_SATS)
            .ok_or(CoinbaseError::Overflow)?;
    }

    let mut vout = Vec::new();
    if params.fee_burn_active {
        vout.push(TxOut {
            value: params.subsidy,
            script_pubkey: params.miner_script.clone(),
        });
        let burned = paid_amount
            .checked_sub(params.subsidy)
            .ok_or(CoinbaseError::Overflow)?;
        vout.push(TxOut {
            value: burned,
            script_pubkey: op_return_script(b"fee-burn"),
        });
    } else {
        vout.push(TxOut {
            value: paid_amount,
            script_pubkey: params.miner_script.clone(),
        });
    }

    if let Some(commission) = &params.commission {
        let script_pubkey = match (&commission.pay_to_pubkey, &commission.pay_to_script) {
            (Some(pubkey), _) => push33_checksig_script(pubkey),
            (None, Some(script)) => script.clone(),
            (None, None) => params.miner_script.clone(),
        };
        vout.push(TxOut {
            value: commission.amount,
            script_pubkey,
        });
    }

    if let Some(signers) = &params.notary_pay_signers {
        if !signers.is_empty() {
            let per_signer = params.fees / signers.len() as u64;
            if per_signer == 0 {
                return Err(CoinbaseError::ZeroNotaryPaySplit);
            }
            for signer in signers {
                vout.push(TxOut {
                    value: per_signer,
                    script_pubkey: push33_checksig_script(signer),
                });
            }
        }
    }

    if let Some(threshold) = params.timelock_threshold {
        if vout[0].value as u64 >= threshold {
            wrap_timelock(&mut vout, params.height)?;
        }
    }

    Ok(Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                txid: [0u8; 32],
                vout: 0xffff_ffff,
            },
            script_sig: coinbase_script_sig(params.height, 0),
            sequence: 0xffff_ffff,
        }],
        vout,
        lock_time: params.lock_time,
        expiry_height: 0,
        shielded_spends: vec![],
        shielded_outputs: vec![],
        joinsplits: vec![],
        is_coinbase: true,
    })
}

/// Inputs to [`build_stake_tx`]: the stake UTXO a staked chain's
/// (out-of-scope) kernel-hash search already selected, plus the split
/// fraction that chain configures (§4.4 step 8, §4.5 "Stake" variant).
#[derive(Debug, Clone)]
pub struct StakeParams {
    pub stake_outpoint: OutPoint,
    pub stake_value: u64,
    pub staker_script: Vec<u8>,
    pub split_percent: f64,
}

/// Builds the stake transaction a staked (non-KMD) chain inserts at
/// template position 1 (`komodo_staked` in the original): spends the
/// selected stake coin back to the staker, skimming `split_percent` of
/// its value into a second output the coinbase folds into its fees.
/// Returns the tx plus the split amount so the caller can add it to the
/// running fee total before composing the coinbase.
pub fn build_stake_tx(params: &StakeParams) -> Result<(Transaction, u64), CoinbaseError> {
    let split_percent = params.split_percent.clamp(0.0, 1.0);
    let split_amount = (params.stake_value as f64 * split_percent) as u64;
    let payout = params
        .stake_value
        .checked_sub(split_amount)
        .ok_or(CoinbaseError::Overflow)?;

    let mut vout = vec![TxOut {
        value: payout,
        script_pubkey: params.staker_script.clone(),
    }];
    if split_amount > 0 {
        vout.push(TxOut {
            value: split_amount,
            script_pubkey: op_return_script(b"stake-split"),
        });
    }

    let tx = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: params.stake_outpoint,
            script_sig: vec![],
            sequence: 0xffff_ffff,
        }],
        vout,
        lock_time: 0,
        expiry_height: 0,
        shielded_spends: vec![],
        shielded_outputs: vec![],
        joinsplits: vec![],
        is_coinbase: false,
    };
    Ok((tx, split_amount))
}

/// Tag byte for the redeem-script OP_RETURN carried alongside a
/// timelock-wrapped coinbase output.
pub const OPRETTYPE_TIMELOCK: u8 = 0xee;

/// Wraps `vout[0]`'s script behind a CLTV-locked P2SH redeem script and
/// appends an OP_RETURN recording that redeem script, so
/// [`unlock_timelocked_vout`] can recover the original script and
/// unlock height later (§4.5, tested by property 6 in the spec's
/// testable-properties list).
fn wrap_timelock(vout: &mut Vec<TxOut>, unlock_height: u32) -> Result<(), CoinbaseError> {
    let original_script = vout[0].script_pubkey.clone();
    if is_p2sh(&original_script) || is_cryptocondition(&original_script) {
        return Err(CoinbaseError::AlreadyWrapped);
    }
    let redeem_script = build_cltv_redeem_script(unlock_height, &original_script);
    let p2sh_script = p2sh_script_pubkey(&redeem_script);
    vout[0].script_pubkey = p2sh_script;

    let mut payload = vec![OPRETTYPE_TIMELOCK];
    payload.extend(unlock_height.to_le_bytes());
    payload.extend((redeem_script.len() as u32).to_le_bytes());
    payload.extend(&redeem_script);
    vout.push(TxOut {
        value: 0,
        script_pubkey: op_return_script(&payload),
    });
    Ok(())
}

/// Recovers `(unlock_height, original_script)` from a timelock-wrapped
/// coinbase's `vout[0]`/`vout[1]` pair, round-tripping what
/// [`wrap_timelock`] encoded.
pub fn unlock_timelocked_vout(vout: &[TxOut]) -> Option<(u32, Vec<u8>)> {
    if vout.len() < 2 {
        return None;
    }
    let op_return = &vout[1];
    if op_return.value != 0 || !komodo_utxo::script::is_op_return(&op_return.script_pubkey) {
        return None;
    }
    let payload = &op_return.script_pubkey[1..];
    if payload.first() != Some(&OPRETTYPE_TIMELOCK) || payload.len() < 9 {
        return None;
    }
    let unlock_height = u32::from_le_bytes(payload[1..5].try_into().ok()?);
    let redeem_len = u32::from_le_bytes(payload[5..9].try_into().ok()?) as usize;
    let redeem_script = payload.get(9..9 + redeem_len)?;
    // The redeem script's tail is the original script appended by
    // `build_cltv_redeem_script`; its head is the CLTV preamble.
    let original_script = redeem_script[CLTV_PREAMBLE_LEN..].to_vec();
    Some((unlock_height, original_script))
}

const CLTV_PREAMBLE_LEN: usize = 6;

fn build_cltv_redeem_script(unlock_height: u32, original_script: &[u8]) -> Vec<u8> {
    let mut redeem = Vec::with_capacity(CLTV_PREAMBLE_LEN + original_script.len());
    redeem.push(0x04); // push 4 bytes
    redeem.extend(unlock_height.to_le_bytes());
    redeem.push(0xb1); // OP_CHECKLOCKTIMEVERIFY
    redeem.extend(original_script);
    redeem
}

fn p2sh_script_pubkey(redeem_script: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(redeem_script);
    let mut script = vec![0xa9, 0x14]; // OP_HASH160, push-20 (single SHA256 stand-in for RIPEMD(SHA256))
    script.extend(&hash[..20]);
    script.push(0x87); // OP_EQUAL
    script
}

fn is_p2sh(script: &[u8]) -> bool {
    script.first() == Some(&0xa9)
}

fn is_cryptocondition(script: &[u8]) -> bool {
    script.first() == Some(&0xcc)
}
