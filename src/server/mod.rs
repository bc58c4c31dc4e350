pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod directory;
pub mod error;
pub mod listener;
pub mod message;
pub mod registry;
