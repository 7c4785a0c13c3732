//! Chain parameters, network constants and arbitrator rotation.

pub mod constants;
pub mod params;

pub use params::{ChainParams, DESTRUCTION_ADDRESS};
