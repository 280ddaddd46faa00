//! Strata CLI - management tool for the agent memory engine

pub mod commands;
pub mod error;
pub mod output;
