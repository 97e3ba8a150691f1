pub mod common;
pub mod evaluate;
pub mod model;
pub mod normalization;

pub use common::*;
pub use evaluate::*;
pub use model::*;
pub use normalization::*;
