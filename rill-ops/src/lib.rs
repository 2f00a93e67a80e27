#![deny(missing_docs)]
//! # rill-ops — the combinator library
//!
//! Every combinator here is a function returning an [`Operator`] consumed by
//! `Flow::pipe`. They divide into four families:
//!
//! - **Transforms** ([`map`], [`try_map`], [`filter`], [`scan`], [`reduce`]) —
//!   stateless or fold-style one-source operators.
//! - **Reducers described by their law** ([`first`], [`first_matching`],
//!   [`distinct_until_changed`] and friends).
//! - **Fan-out / fan-in** ([`switch_map`], [`merge_map`], [`concat_map`]) —
//!   projection into inner sources with cancellation and expansion lineage.
//! - **Coordination** ([`buffer_until`], [`with_latest_from`],
//!   [`with_latest_from_all`], [`skip_until`]) — two-source operators ordered
//!   by emission stamps, never by future-resolution order.
//! - **Temporal** ([`debounce`], [`throttle`], [`delay`]) — timer-owning
//!   operators that cancel their timers on close.
//!
//! [`Operator`]: rill_core::Operator

mod coordinate;
mod flatten;
mod take;
mod temporal;
mod transform;
mod util;

pub use coordinate::{Aux, buffer_until, skip_until, with_latest_from, with_latest_from_all};
pub use flatten::{Inner, concat_map, merge_map, switch_map};
pub use take::{
    distinct_until_changed, distinct_until_changed_by, distinct_until_key_changed, first,
    first_matching,
};
pub use temporal::{debounce, delay, throttle};
pub use transform::{filter, map, reduce, scan, try_map};
