pub mod breakpoint;
pub mod chain;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod file;
pub mod gate;
pub mod hashing;
pub mod interceptor;
pub mod output;
pub mod store;
pub mod strategy;
pub mod task;
pub mod utils;

pub use breakpoint::{BlockInfo, BreakpointInfo, ContentLength};
pub use config::DownloadConfig;
pub use context::DownloadContext;
pub use downloader::Downloader;
pub use error::{Error, Result};
pub use task::DownloadTask;
