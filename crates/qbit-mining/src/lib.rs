//! # qbit-mining
//!
//! Block template construction and submission for external miners.
//!
//! The node exposes `get_block_template` / `submit_block`; the hashing
//! worker itself is external. Templates select mempool transactions by
//! descending fee rate under the block-size and sigop-cost caps, keeping
//! in-template parents ahead of their children, and carry a coinbase paying
//! subsidy plus fees to the supplied destination.

mod coinbase;
mod error;
mod template;

pub use coinbase::build_coinbase;
pub use error::{MiningError, MiningResult};
pub use template::{BlockTemplate, SubmissionResult, TemplateBuilder};
