//! Speculative decoding.
//!
//! ## How it works
//!
//! 1. **Draft Phase**: A small, fast draft model proposes up to K tokens,
//!    one forward pass each.
//!
//! 2. **Verify Phase**: The larger target model scores all K draft positions
//!    plus one bonus position in a single forward pass.
//!
//! 3. **Rejection Sampling**: Each draft token is accepted or rejected based on
//!    the probability ratio between target and draft distributions.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [prompt] -> t1 -> t2 -> t3 -> t4
//! Target verify:   [prompt, t1, t2, t3, t4] -> distributions for 5 positions
//! Rejection:       Accept t1, t2, reject t3, resample -> final: t1, t2, t3'
//! ```
//!
//! The stepping driver that spreads this over discrete, pausable
//! transitions lives in [`crate::engine`].

pub mod config;
pub mod sampler;

pub use config::SpeculativeConfig;
pub use sampler::{RejectionSampler, Verdict};
