//! # sealpost
//!
//! Signed and encrypted messages over a keyring that reconciles every key
//! it is handed before trusting it.

pub mod cli;
pub mod compose;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod popup;
pub mod ui;
pub mod unlock;
pub mod view;

pub use error::{Result, SealError};
