//! Value types shared by the shadowmaker pipeline stages.

mod types;

pub use types::*;
