#![deny(rust_2018_idioms)]

#[macro_use]
extern crate async_trait;

#[macro_use]
extern crate smallvec;

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

#[cfg(test)]
pub mod test_utils;

pub mod actions;
pub mod bcache;
pub mod block;
pub mod bops;
pub mod chains;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handle;
pub mod id;
pub mod identity;
pub mod kcache;
pub mod kmgr;
pub mod md;
pub mod mdcache;
pub mod mdops;
pub mod nodecache;
pub mod observer;
pub mod ops;
pub mod path;
pub mod server;
pub mod splitter;
pub mod status;

mod codec;
mod flusher;
mod resolver;
mod updater;

pub use config::VeilConfig;
pub use engine::FolderEngine;
pub use error::{VeilError, VeilResult};
