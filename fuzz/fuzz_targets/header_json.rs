#![no_main]

use komodo_consensus::{bits_to_target, check_pow, header_hash, BlockHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = serde_json::from_slice::<BlockHeader>(data) {
        let _ = header_hash(&header);
        let _ = bits_to_target(header.bits);
        let _ = check_pow(&header);
    }
});
