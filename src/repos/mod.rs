//! Repository layer: persistence only, no business logic.
//!
//! All functions take a `&mut SqliteConnection` so callers control
//! transaction scope — a transaction is never held across network I/O.

pub mod company;
pub mod generation;
pub mod guide;
pub mod matrix;
