//! Shared type definitions
//!
//! This module contains all shared data types used across the bridge.

pub mod config;
pub mod message;
pub mod model;
