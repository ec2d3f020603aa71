pub mod audit;
pub mod config;
pub mod event;
pub mod locator;
pub mod processor;
pub mod token;
pub mod upload;
