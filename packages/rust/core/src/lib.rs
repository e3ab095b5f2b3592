//! Core pipeline orchestration and domain logic for repolore.
//!
//! This crate turns per-dimension scanner evidence into signals, budgets and
//! context snapshots, drives the production agent over every dimension in
//! order, and falls back to heuristic candidates whenever that fails.

pub mod bridge;
pub mod budget;
pub mod collaborators;
pub mod digest;
pub mod dimension_context;
pub mod orchestrator;
pub mod pipeline_context;
pub mod signals;
mod stage;
#[cfg(test)]
mod testing;
