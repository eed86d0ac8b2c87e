//! On-demand handoff channel.
//!
//! A single-slot, alternating-turn rendezvous that lets a long-running producer (for
//! example an interactive authorization procedure) be written as straight-line async code
//! while a consumer pulls one value at a time and answers each with a hint.

pub mod error;
pub mod on_demand;
pub mod state;

pub use error::{Cancelled, ChannelError, Failure, Result};
pub use on_demand::{ChannelOptions, OnDemandChannel, ProducerScope};
pub use state::StateKind;
