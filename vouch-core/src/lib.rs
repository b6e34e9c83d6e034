#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]
#![deny(unreachable_pub)]

//! vouch-core

pub mod code;
pub mod common;
pub mod extract;
pub mod handle;
