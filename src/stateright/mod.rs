//! Stateright Model Checking for the replica repository
//!
//! Exhaustive state-space exploration of the replica lifecycle, next to the
//! randomized simulation in `repository::dst`.
//!
//! ```text
//!     ┌───────────────────────────────┐
//!     │   Stateright  │   DST Tests   │
//!     │  (Exhaustive) │ (Simulation)  │
//!     └───────────────────────────────┘
//! ```
//!
//! ## Available Models
//!
//! - `lifecycle`: handles, state changes, pins and space accounting
//!
//! ## Running Model Checks
//!
//! ```bash
//! cargo test stateright_lifecycle -- --ignored --nocapture
//! ```

pub mod lifecycle;
