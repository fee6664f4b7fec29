pub mod aoi;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod resolver;
pub mod retry;
pub mod tile;

pub use error::{Error, Result};
