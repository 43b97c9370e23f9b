//! Domain model module declarations.

pub mod decision;
pub mod plan;
pub mod result;
pub mod session;
