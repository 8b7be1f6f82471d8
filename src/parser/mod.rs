//! Header-level message handling shared by the bounce classifier and the
//! send path.

pub mod header;
