pub mod config;
pub mod context;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod prompt;
pub mod relay;
pub mod response;
pub mod scope;
pub mod server;
pub mod tools;
