//! ArborDB - embedded file-backed document store

pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod index;
pub mod storage;

pub use codec::Value;
pub use config::Config;
pub use error::{ArborError, ArborResult};
pub use handle::{Handle, HandleNavigator, HandleReader, HandleStats, HandleWriter};
pub use index::IndexManager;
pub use storage::{Database, RootProvider, SmartPointer, TypeTag};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
