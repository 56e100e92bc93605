//! Device Catalog
//!
//! The in-memory form of a `<category>.builder` file: ring parameters, device slots and the
//! current partition assignment, plus the search syntax used to select devices.

pub mod search;
pub mod types;
