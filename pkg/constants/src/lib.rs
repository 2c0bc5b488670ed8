//! Centralized constants for the csrd project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod approver;
pub mod cloud;
pub mod identity;
pub mod signer;
