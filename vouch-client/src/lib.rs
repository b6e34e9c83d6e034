#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]
#![deny(unreachable_pub)]

//! vouch-client
//!
//! Email login via one-time codes, and proof of ownership of linked social
//! accounts via codes placed on the account's public profile.

pub mod accounts;
pub mod challenge;
pub mod cli;
pub mod engine;
pub mod error;
pub mod governor;
pub mod logging;
pub mod matcher;
pub mod models;
pub mod paths;
pub mod poller;
pub mod promoter;
pub mod settings;
pub mod setups;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
