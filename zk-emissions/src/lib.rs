pub mod constants;
pub mod error;
pub mod ledger;
pub mod programs;
pub mod proof;
pub mod tree;
pub mod trust;
pub mod types;
pub mod verifier;

pub use error::CarbonError;
