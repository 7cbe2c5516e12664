//! Uniform cancellable solver interface (C7) over interchangeable
//! Equihash back-ends. The solvers themselves are out of scope (§1,
//! "invoked as an opaque function returning a candidate solution") —
//! what lives here is the callback contract and the two back-end
//! selectors the mining driver picks between.

use parking_lot::Mutex;
use std::sync::Arc;

/// Shared cooperative-cancellation flag (§5, §9): flipped under a short
/// hold by a tip-change subscription, polled by the driver and by
/// whichever solver is running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<Mutex<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
    }

    pub fn reset(&self) {
        *self.cancelled.lock() = false;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }
}

/// One Equihash solution candidate as handed to the `accept` callback.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: [u8; 32],
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("solver runtime error: {0}")]
    Runtime(String),
}

/// Outcome of a single `solve` call: either a solution the caller's
/// `accept` closure took, or a cancellation/exhaustion with no winner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    Accepted,
    Cancelled,
    Exhausted,
}

/// Back-end contract both solvers implement: given a header preimage and
/// the two closures from §9 ("accept(solution) -> bool" and
/// "cancelled() -> bool"), drive the search until one is accepted, the
/// cancel token fires, or the search space is exhausted.
pub trait SolverBackend {
    fn solve(
        &self,
        header_preimage: &[u8],
        cancel: &CancelToken,
        accept: &mut dyn FnMut(Solution) -> bool,
    ) -> Result<SolveOutcome, SolverError>;
}

/// The external GPU-style solver (`tromp`): configured, run in
/// digit-steps, and expected to surface up to `MAXSOLS` candidate
/// solutions per step (§4.7). This stand-in enumerates a small,
/// deterministic sequence of synthetic solutions in place of the real
/// Equihash search, so the driver/back-end contract can be exercised
/// without linking the actual GPU solver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrompSolver {
    pub max_solutions: usize,
}

impl SolverBackend for TrompSolver {
    fn solve(
        &self,
        header_preimage: &[u8],
        cancel: &CancelToken,
        accept: &mut dyn FnMut(Solution) -> bool,
    ) -> Result<SolveOutcome, SolverError> {
        let cap = if self.max_solutions == 0 {
            1
        } else {
            self.max_solutions
        };
        for step in 0..cap {
            if cancel.is_cancelled() {
                return Ok(SolveOutcome::Cancelled);
            }
            let solution = synthetic_solution(header_preimage, step as u32);
            if accept(solution) {
                return Ok(SolveOutcome::Accepted);
            }
        }
        Ok(SolveOutcome::Exhausted)
    }
}

/// The branch-and-bound `default` solver (§4.7): polls `cancelled()` at
/// every checkpoint and resets cleanly on cancellation rather than
/// propagating an error, mirroring "catches its cancellation exception
/// and resets cancelSolver to false".
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSolver {
    pub max_attempts: u32,
}

impl SolverBackend for DefaultSolver {
    fn solve(
        &self,
        header_preimage: &[u8],
        cancel: &CancelToken,
        accept: &mut dyn FnMut(Solution) -> bool,
    ) -> Result<SolveOutcome, SolverError> {
        let attempts = if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        };
        for nonce in 0..attempts {
            if cancel.is_cancelled() {
                cancel.reset();
                return Ok(SolveOutcome::Cancelled);
            }
            let solution = synthetic_solution(header_preimage, nonce);
            if accept(solution) {
                return Ok(SolveOutcome::Accepted);
            }
        }
        Ok(SolveOutcome::Exhausted)
    }
}

fn synthetic_solution(header_preimage: &[u8], counter: u32) -> Solution {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(header_preimage);
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&digest);
    Solution {
        nonce,
        bytes: digest.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_solver_accepts_first_matching_solution() {
        let solver = DefaultSolver { max_attempts: 50 };
        let cancel = CancelToken::new();
        let mut seen = 0;
        let outcome = solver
            .solve(b"header", &cancel, &mut |_solution| {
                seen += 1;
                seen == 3
            })
            .unwrap();
        assert_eq!(outcome, SolveOutcome::Accepted);
        assert_eq!(seen, 3);
    }

    #[test]
    fn cancellation_is_observed_before_next_attempt() {
        let solver = DefaultSolver { max_attempts: 1000 };
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = solver.solve(b"header", &cancel, &mut |_| false).unwrap();
        assert_eq!(outcome, SolveOutcome::Cancelled);
        assert!(!cancel.is_cancelled(), "default solver resets the flag");
    }

    #[test]
    fn tromp_solver_exhausts_without_accepting() {
        let solver = TrompSolver { max_solutions: 4 };
        let cancel = CancelToken::new();
        let outcome = solver.solve(b"header", &cancel, &mut |_| false).unwrap();
        assert_eq!(outcome, SolveOutcome::Exhausted);
    }
}
