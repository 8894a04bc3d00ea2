//! Coverage-guided greybox fuzzer for text-input parsers
//!
//! The core loop: a seed scheduler picks the next input, a power schedule
//! decides how many mutations it earns, a grammar-aware mutator derives
//! them, workers run each against the target parser, an interestingness
//! scorer grades every run against the persisted campaign history, and
//! sufficiently interesting mutations are promoted back into the seed
//! pool. Runs and the coverage frontier live in a SQLite store.

pub mod config;
pub mod controller;
pub mod corpus;
pub mod grammar;
pub mod mutator;
pub mod power;
pub mod scheduler;
pub mod scorer;
pub mod store;
pub mod target;
pub mod ucb;
pub mod workers;
