pub mod bserver;
pub mod kserver;
pub mod kvstore;
pub mod mdserver;

pub use bserver::{BlockContext, BlockServer, BlockServerLocal, RefStatus};
pub use kserver::{KeyServer, KeyServerLocal};
pub use kvstore::{KvStore, MemKv};
pub use mdserver::{MdServer, MdServerLocal, MdStatus, UpdateSignal};

#[cfg(test)]
mod tests;
