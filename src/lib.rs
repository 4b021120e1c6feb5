pub mod app;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod lims;
pub mod manifest;
pub mod output;
pub mod report;
pub mod store;
pub mod workflow;
