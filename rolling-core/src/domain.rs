pub mod ids;
pub mod segment;
pub mod document;
pub mod task;
pub mod run;

pub use ids::*;
pub use segment::*;
pub use document::*;
pub use task::*;
pub use run::*;
