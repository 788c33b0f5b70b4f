//! Cycle-level model of an instruction prefetch cache sitting between a
//! fetch stage and a pipelined Wishbone bus.

pub mod addr;
mod bin;
pub mod breakpoint;
pub mod bus;
pub mod cache_store;
pub mod common;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod image;
pub mod memory;
pub mod predictor;
pub mod sim;

#[cfg(feature = "stat")]
pub mod stat;
