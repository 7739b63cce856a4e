//! Operator tooling for the courier job queue: configuration discovery and
//! the commands behind `courierctl`.

pub mod commands;
pub mod config;
