//! Control layer exposing driver state to external tooling.

/// Status snapshots and console actions.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
