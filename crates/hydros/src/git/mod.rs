//! Git plumbing: checkouts, commits and force-pushes.

pub mod auth;
pub mod parse;
pub mod repository;

pub use repository::{remote_url, GitRepository};
