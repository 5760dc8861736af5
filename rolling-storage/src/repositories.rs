pub mod task;
pub mod run;

pub use task::*;
pub use run::*;
