//! Supporting code for search definition and variant records.

pub mod data;
pub mod query;

pub use data::*;
pub use query::*;
