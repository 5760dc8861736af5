pub mod postgres;
pub mod repositories;
pub mod memory;

pub use repositories::*;
pub use memory::*;
