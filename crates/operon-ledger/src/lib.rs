//! # operon-ledger
//!
//! Cost accounting for Operon pipelines:
//!
//! - **Aggregation**: pipeline totals recomputed from persisted run
//!   rows, so the numbers survive crashes and repeated aggregation
//! - **Budget**: project-level ceilings with clamped remaining spend
//! - **Tiers**: substring model-id classification feeding the per-tier
//!   cost breakdown and tiered model routing

#![allow(dead_code)]

mod ledger;
mod tiers;

pub use ledger::{BudgetStatus, CostLedger};
pub use tiers::{tier_for_model, ModelTier};
