#![deny(dead_code)]
#![deny(unused_imports)]

pub mod analysis;
pub mod bootstrap;
pub mod config;
pub mod data;
pub mod dca;
pub mod gee;
pub mod metrics;
pub mod model;
pub mod sandwich;
