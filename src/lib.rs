// ABOUTME: Library module for pg-provisioner
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod access;
pub mod commands;
pub mod config;
pub mod error;
pub mod migration;
pub mod postgres;
pub mod utils;
