/// wasm-farm library crate.
///
/// The binary (src/main.rs) is a thin clap front end over these modules;
/// integration tests in tests/ drive them directly via `wasm_farm::`.
pub mod claim;
pub mod config;
pub mod error;
pub mod inspect;
pub mod logfile;
pub mod packages;
pub mod process;
pub mod report;
pub mod scan;
pub mod supervisor;
pub mod worker;
