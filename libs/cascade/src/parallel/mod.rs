//! Proportional parallel dispatch
//!
//! - [`allocation`]: Hamilton's method piece split
//! - [`round`]: round state, completion reports and EMA reweighting
//! - [`array`]: [`ParallelSystemArray`], which runs rounds over a SystemArray

pub mod allocation;
pub mod array;
pub mod round;

pub use allocation::allocate;
pub use array::{ParallelSystemArray, DEFAULT_SMOOTHING};
pub use round::{normalized_rates, reweight, RateSample, RoundCallbacks, RoundPhase, RoundReport};
