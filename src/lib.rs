pub mod chain;
pub mod config;
pub mod decision;
pub mod error;
pub mod fees;
pub mod operation_log;
pub mod supervisor;
pub mod sweep;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod testing;
