//! Business logic layer: user resolution, authorization decisions, credit
//! accounting.

pub mod authorization_service;
pub mod credit_service;
pub mod user_service;
