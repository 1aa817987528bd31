//! Meridian -- a local, single-tenant automation runtime.
//!
//! Turns natural-language requests into vetted, sandboxed tool invocations:
//! Scout asks a planner for a structured execution plan, Sentinel reviews it
//! independently (with decision memory and optional human approval), and
//! Axis runs the approved steps through the isolated Gear runtime with
//! fault-tolerant scheduling. Every security-relevant transition lands in a
//! hash-chained audit log.

#![allow(missing_docs)] // enforced selectively while the core API settles

pub mod audit;
pub mod axis;
pub mod config;
pub mod error;
pub mod gear;
pub mod logging;
pub mod pipeline;
pub mod plan;
pub mod scout;
pub mod sentinel;
pub mod store;
pub mod types;
