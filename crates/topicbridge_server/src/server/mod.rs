#![forbid(unsafe_code)]

pub mod admin;
pub mod auth;
pub mod callbacks;
pub mod health;
pub mod moderation;
pub mod relay;
pub mod reply;
pub mod resolver;
pub mod router;
pub mod state;
pub mod store;
pub mod templates;
pub mod webhook;

#[cfg(test)]
mod testkit;

#[cfg(test)]
mod relay_tests;
