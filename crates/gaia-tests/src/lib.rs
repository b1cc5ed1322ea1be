//! Integration test crate for the GAIA control plane.
//!
//! All tests live in `tests/`; this library is intentionally empty.
