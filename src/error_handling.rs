//! Error types shared by the storage layer, the configuration loader and the
//! command-line driver.

pub mod types;
