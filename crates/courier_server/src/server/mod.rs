#![forbid(unsafe_code)]

pub mod auth;
pub mod channels;
pub mod connection;
pub mod health;
pub mod session;
pub mod state;
pub mod store;

#[cfg(test)]
mod channels_tests;
