//! Push-notification lift analysis.
//!
//! Loads push delivery and conversion data from two stores, reconciles the
//! control group onto the push layout, and measures deposit conversion of
//! every A/B group against the control group.

pub mod analyzer;
pub mod cache;
pub mod columnar;
pub mod config;
pub mod error;
pub mod gateway;
pub mod loader;
pub mod model;
pub mod params;
pub mod rng;
pub mod schema;
pub mod snapshot;
pub mod synth;
pub mod table;
pub mod tier;
pub mod types;
