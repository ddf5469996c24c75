//! Chorus Auth - identity and permission resolution for edge nodes
//!
//! This crate provides:
//! - The authentication pipeline (live session, cache, backend, fallback)
//! - A persisted user cache holding salted secret digests only
//! - HTTP and directory backends behind the `AuthBackend` trait
//! - The edge-local ACL view, replaced atomically from hub snapshots

mod acl_view;
mod backend;
mod cache;
mod config;
mod sessions;
mod synchronizer;

pub use acl_view::*;
pub use backend::*;
pub use cache::{CacheError, CachedUser, UserCache};
pub use config::*;
pub use sessions::*;
pub use synchronizer::*;
