//! Alphaloop: autonomous discovery engine for algorithmic trading
//! strategies on the Taiwan equities market.
//!
//! The engine repeatedly proposes a candidate strategy (an LLM-filled
//! template or an evolved factor graph), validates it statically, runs
//! it in an isolated worker against historical data, scores the
//! result, and feeds the outcome back into the next proposal while a
//! champion tracker keeps the best strategy found so far.

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

#[doc(hidden)]
pub mod testutil;

pub use application::{IterationExecutor, LearningLoop, RunSummary, ShutdownHandle};
pub use domain::models::config::Config;
