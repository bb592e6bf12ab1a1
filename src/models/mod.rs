//! Domain model module declarations.

pub mod event;
pub mod lock;
pub mod pending;
pub mod session;
