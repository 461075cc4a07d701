//! A single-process development web server.
//!
//! Requests are read by an epoll-driven loop, resolved against a document root, and answered
//! from static files, a router script, or a script engine.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod listener;
pub mod parser;
pub mod path;
pub mod reactor;
pub mod request;
pub mod response;
pub mod script;
pub mod server;

pub use config::Config;
pub use script::{CommandEngine, ScriptEngine};
pub use server::Server;
