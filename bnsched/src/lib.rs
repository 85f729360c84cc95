pub mod baseline;
pub mod batchnorm;
pub mod bench;
pub mod codegen;
pub mod color;
pub mod common;
pub mod expr;
pub mod graph;
pub mod lower;
pub mod plot;
pub mod pprint;
pub mod scheduling;
pub mod target;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
