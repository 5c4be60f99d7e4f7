//! Purpose: Persistent, memory-mapped, append-only record queue.
//! Exports: `api` (stable surface), `core` (cycle stores, index, lock, appender, errors).
//! Role: Library crate; records are framed in per-cycle files and addressed by a packed index.
//! Invariants: A record is visible to readers only once its header is `READY`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
