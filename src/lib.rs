pub mod config;
pub mod conversions;
pub mod humanize;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod rules;
pub mod subprocess;
