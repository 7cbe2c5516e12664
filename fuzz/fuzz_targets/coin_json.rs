#![no_main]

use komodo_utxo::{Coin, InMemoryUtxoView, OutPoint, UtxoView};
use libfuzzer_sys::fuzz_target;

#[derive(serde::Deserialize)]
struct Entry {
    outpoint: OutPoint,
    coin: Coin,
}

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = serde_json::from_slice::<Entry>(data) {
        let mut view = InMemoryUtxoView::new();
        assert!(!view.has_coin(&entry.outpoint));
        view.insert(entry.outpoint.clone(), entry.coin.clone());
        assert!(view.has_coin(&entry.outpoint));
        assert_eq!(view.access_coin(&entry.outpoint), Some(entry.coin));
        view.remove(&entry.outpoint);
        assert!(!view.has_coin(&entry.outpoint));
    }
});
