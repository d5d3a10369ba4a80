pub mod aggregate;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod head;
pub mod history;
pub mod inferer;
pub mod meter;
pub mod persistence;
pub mod project;
pub mod render;
pub mod tensor;
pub mod trainer;
pub mod utils;

pub use config::Config;
pub use engine::{Engine, Operation};
pub use error::{Error, Result};
pub use tensor::{ImageTensor, Matrix, RawEmbeddings};
