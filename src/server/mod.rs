//! HTTP front end over the store.
//!
//! - [`api`]: routes and handlers

pub mod api;
