//! Shared data model for the warden policy engine.
//!
//! This crate holds the types that cross the engine's boundaries: the
//! datastore-facing model (`model`), label selectors (`labels`), policy rule
//! bodies in raw and dataplane-parsed form (`rules`), and the messages the
//! calculation graph emits to the dataplane driver (`proto`).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod model;
pub mod proto;
pub mod rules;

pub use self::labels::{tag_set_id, Labels, Selector};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
