//! Domain model module declarations.

pub mod geometry;
pub mod stats;
pub mod status;
