// Library exports for octo-proxy
// Makes modules accessible to tests and the octo binary

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod logger;
pub mod metrics;
pub mod proxy;
pub mod resolver;
pub mod runner;
pub mod watcher;
