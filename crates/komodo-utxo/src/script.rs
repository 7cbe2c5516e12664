//! Minimal opcode scanning: sigop counting and the notary-signer pattern
//! match used by the mining crate's notarisation detector. This is not a
//! script interpreter — it only recognizes the handful of opcodes the
//! spec's algorithms need to see.

/// `OP_CHECKSIG`.
pub const OP_CHECKSIG: u8 = 0xac;
/// `OP_CHECKSIGVERIFY`.
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
/// `OP_CHECKMULTISIG`.
pub const OP_CHECKMULTISIG: u8 = 0xae;
/// `OP_CHECKMULTISIGVERIFY`.
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
/// `OP_RETURN`.
pub const OP_RETURN: u8 = 0x6a;
/// Push-33-bytes opcode (a compressed pubkey push), the first half of the
/// notary-signer pattern `push33 <pubkey> OP_CHECKSIG`.
pub const OP_PUSH33: u8 = 0x21;

/// Legacy (non-P2SH-aware) sigop count the way `GetSigOpCount(fAccurate=
/// false)` does: `OP_CHECKMULTISIG{,VERIFY}` counts as
/// [`MULTISIG_SIGOP_COUNT`] regardless of the actual key count baked into
/// the script, everything else in `OP_CHECKSIG{,VERIFY}` counts as one.
pub const MULTISIG_SIGOP_COUNT: usize = 20;

/// Counts sigops in a raw script, walking past push-data payloads so a
/// pushed byte that happens to equal an opcode value is never
/// double-counted.
pub fn count_sigops(script: &[u8]) -> usize {
    let mut count = 0usize;
    let mut i = 0usize;
    while i < script.len() {
        let op = script[i];
        match op {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count += 1;
                i += 1;
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += MULTISIG_SIGOP_COUNT;
                i += 1;
            }
            0x01..=0x4b => {
                // direct push of `op` bytes
                i += 1 + op as usize;
            }
            0x4c => {
                // OP_PUSHDATA1: one length byte follows
                if i + 1 >= script.len() {
                    break;
                }
                let len = script[i + 1] as usize;
                i += 2 + len;
            }
            0x4d => {
                // OP_PUSHDATA2: two little-endian length bytes follow
                if i + 2 >= script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[i + 1], script[i + 2]]) as usize;
                i += 3 + len;
            }
            0x4e => {
                // OP_PUSHDATA4: four little-endian length bytes follow
                if i + 4 >= script.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    script[i + 1],
                    script[i + 2],
                    script[i + 3],
                    script[i + 4],
                ]) as usize;
                i += 5 + len;
            }
            _ => {
                i += 1;
            }
        }
    }
    count
}

pub fn is_op_return(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN)
}

/// Matches the notary-signer pattern `push33 <33-byte pubkey> OP_CHECKSIG`,
/// returning the pushed pubkey on a match. Used by the notarisation
/// detector (component C3) to test a transaction's outputs against the
/// active notary set.
pub fn match_push33_checksig(script_pubkey: &[u8]) -> Option<&[u8]> {
    if script_pubkey.len() != 35 {
        return None;
    }
    if script_pubkey[0] != OP_PUSH33 {
        return None;
    }
    if script_pubkey[34] != OP_CHECKSIG {
        return None;
    }
    Some(&script_pubkey[1..34])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_single_checksig() {
        let script = vec![OP_CHECKSIG];
        assert_eq!(count_sigops(&script), 1);
    }

    #[test]
    fn counts_multisig_as_twenty() {
        let script = vec![OP_CHECKMULTISIG];
        assert_eq!(count_sigops(&script), MULTISIG_SIGOP_COUNT);
    }

    #[test]
    fn push_data_is_skipped_not_scanned() {
        // A direct push of 2 bytes that happen to equal OP_CHECKSIG's byte,
        // followed by a real OP_CHECKSIG. Only the trailing opcode counts.
        let script = vec![0x02, OP_CHECKSIG, OP_CHECKSIG, OP_CHECKSIG];
        assert_eq!(count_sigops(&script), 1);
    }

    #[test]
    fn pushdata1_length_is_honored() {
        let mut script = vec![0x4c, 0x03, 0xac, 0xac, 0xac];
        script.push(OP_CHECKSIG);
        assert_eq!(count_sigops(&script), 1);
    }

    #[test]
    fn op_return_detection() {
        assert!(is_op_return(&[OP_RETURN, 0x04, 1, 2, 3, 4]));
        assert!(!is_op_return(&[OP_CHECKSIG]));
    }

    #[test]
    fn push33_checksig_pattern_matches() {
        let mut script = vec![OP_PUSH33];
        script.extend([7u8; 33]);
        script.push(OP_CHECKSIG);
        let pubkey = match_push33_checksig(&script).unwrap();
        assert_eq!(pubkey, &[7u8; 33][..]);
    }

    #[test]
    fn push33_checksig_pattern_rejects_wrong_length() {
        let script = vec![OP_PUSH33, 1, 2, OP_CHECKSIG];
        assert!(match_push33_checksig(&script).is_none());
    }
}
