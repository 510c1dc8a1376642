//! Sandbox worker binary.
//!
//! Receives one JSON job on stdin, evaluates the strategy against the
//! local data directory, simulates it, and reports JSON lines on
//! stdout. The parent process owns isolation (session, rlimits,
//! scratch directory) and reclamation; this binary only computes.

fn main() {
    std::process::exit(alphaloop::infrastructure::sandbox::run_worker_stdio());
}
