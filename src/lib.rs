pub mod app;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod harvest;
pub mod inat;
pub mod materialize;
pub mod normalize;
pub mod output;
pub mod query;
pub mod rate;
pub mod resolve;
pub mod store;
