pub mod provision;
pub mod source;

pub use provision::*;
