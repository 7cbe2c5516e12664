//! Mempool ordering, notarisation detection, coinbase composition,
//! template assembly, the solver adapter, and the mining driver loop —
//! the library half of the daemon binary.

pub mod block_template;
pub mod coinbase;
pub mod driver;
pub mod mempool;
pub mod notarization;
pub mod solver;
