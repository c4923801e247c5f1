//! Tests for the coresync-engine crate.

mod helpers;
