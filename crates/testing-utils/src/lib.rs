//! # Dispatch Testing Utils
//!
//! Shared testing utilities for the booking dispatch workspace:
//! in-memory mock implementations of the repository/collaborator ports
//! and builders for test data. Add as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! dispatch-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
