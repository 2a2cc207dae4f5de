pub mod activity;
pub mod circuit;
pub mod clock;
pub mod command;
pub mod config;
pub mod content;
pub mod crm;
pub mod dead_letter;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod event;
pub mod kv;
pub mod overrides;
pub mod progress;
pub mod queue;
pub mod rate_limit;
pub mod replay;
pub mod rng;
pub mod segment;
pub mod simulation;
pub mod store;
pub mod types;
pub mod worker;
