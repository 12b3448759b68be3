//! Dependency and risk analysis
//!
//! Read-only: nothing in here issues DDL. Every analyzer talks to the
//! database through [`crate::db::CatalogClient`] and wraps each round trip
//! in the caller's [`crate::context::OperationContext`].

pub mod dependency;
pub mod foreign_key;
pub mod risk;
pub mod table_rename;
