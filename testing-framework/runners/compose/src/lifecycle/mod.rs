pub mod cleanup;
pub mod readiness;
