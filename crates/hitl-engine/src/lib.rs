//! # hitl-engine
//!
//! The batch loop behind human-in-the-loop color optimization: propose a
//! color, render the molecule with it, store the image, attach a note and
//! leave the trial for a human to score. At most `n_batch` trials wait for
//! scores at any time.

pub mod config;
pub mod controller;
pub mod http;

pub use config::LoopConfig;
pub use controller::{BatchController, DispatchedTrial, LoopContext, LoopStep};

use tracing_subscriber::EnvFilter;

/// Bind address of the feedback service when `HITL_FEEDBACK_ADDR` is unset.
pub const DEFAULT_FEEDBACK_ADDR: &str = "127.0.0.1:8082";

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
