//! # operon-gate
//!
//! Human gates for Operon pipelines:
//!
//! - **Interventions**: blocking questions that park the pipeline on a
//!   oneshot future until an operator resolves them, exactly once
//! - **Consultations**: non-blocking questions whose answers become L1
//!   decision memories
//! - **Blocks**: blocking consultations raised mid-stage that suspend
//!   the stage timeout clock while parked
//!
//! Gates are persisted before they park and expired wholesale when a
//! pipeline is cancelled, so no caller is ever left waiting forever.

#![allow(dead_code)]

mod gates;
mod hold;

pub use gates::{GateManager, EXPIRED_ANSWER};
pub use hold::{HoldCounter, HoldGuard};
