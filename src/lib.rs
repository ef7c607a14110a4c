pub mod controllers;
pub mod error;
pub mod models;
pub mod runtime;
pub mod settings;
pub mod storage;

pub use error::{Error, Result};
pub use settings::Settings;
