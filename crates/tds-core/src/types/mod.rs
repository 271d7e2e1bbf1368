//! Core protocol enums and the session principal.

pub mod enums;
pub mod principal;

pub use enums::*;
pub use principal::*;
