//! # Reconcilers
//!
//! The controllers and the per-function phase machine. Reconciles are
//! level-triggered and serialized per key by the controller runtime;
//! everything they apply is an idempotent upsert, so re-running a pass is
//! always safe.

pub mod agent;
pub mod context;
pub mod controller;
pub mod function;
pub mod sweeper;

pub use context::Ctx;
