//! Distribution channel backends.

pub mod local;

pub use local::LocalDistributionChannel;
