pub mod api;
pub mod capture;
pub mod config;
pub mod election;
pub mod error;
pub mod model;
pub mod owner;
pub mod processor;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
