pub mod cli;
pub mod gpu;

pub use cli::*;
pub use gpu::*;
