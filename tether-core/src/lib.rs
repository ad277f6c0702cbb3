pub mod bus;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod lsp;
pub mod util;

pub use error::{Error, Result};
