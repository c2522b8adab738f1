//! Filesystem layout of a guest image.
//!
//! Callers import path helpers from here; the implementation lives in the
//! private `core` module and `endpoints`.

mod core;
pub mod endpoints;

pub use self::core::{GuestLayout, rewrite_for_prefix};
pub use endpoints::EndpointLayout;
