pub mod alerts;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod fanout;
pub mod gateway;
pub mod liveness;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod processor;
pub mod rest;
pub mod rules;
pub mod store;
pub mod validate;
pub mod ws;
