//! Process surface of the recorder: configuration and the HTTP API

pub mod api;
pub mod config;
