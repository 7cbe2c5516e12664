#![no_main]

use komodo_consensus::{check_pow, merkle_root, Block};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(block) = serde_json::from_slice::<Block>(data) {
        let txids = block
            .txs
            .iter()
            .map(|tx| tx.txid())
            .collect::<Result<Vec<_>, _>>();
        if let Ok(ids) = txids {
            let root = merkle_root(&ids);
            if root == block.header.merkle_root {
                let _ = check_pow(&block.header);
            }
        }
    }
});
