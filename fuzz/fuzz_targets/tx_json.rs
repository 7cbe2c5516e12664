#![no_main]

use komodo_utxo::Transaction;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(tx) = serde_json::from_slice::<Transaction>(data) {
        let _ = tx.validate();
        let _ = tx.canonical_bytes();
        let _ = tx.txid();
        let _ = tx.modified_size();
        let _ = tx.sigop_count();
        let _ = tx.value_out();
        let _ = tx.has_duplicate_inputs();
    }
});
