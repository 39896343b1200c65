//! # itemhub-domain
//!
//! Pure domain model for the itemhub integration hub.
//!
//! ## Responsibilities
//! - Foundational types: item identifiers, error conventions, timestamps
//! - Define the closed dynamic [`Value`](value::Value) type used for item parameters
//! - Define **item state** ([`ItemState`](state::ItemState)) and the immutable global
//!   snapshot ([`StatesContainer`](state::StatesContainer))
//! - Define **change events** ([`StateChangedEvent`](event::StateChangedEvent))
//! - Define declarative **item configs** ([`ItemConfig`](config::ItemConfig)) and
//!   their schema-directed decoding into typed structs
//! - Define per-item **tracking rules** that suppress noisy notifications
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod config;
pub mod event;
pub mod state;
pub mod tracking;
pub mod value;
