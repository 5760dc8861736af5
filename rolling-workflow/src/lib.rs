pub mod collect;
pub mod executor;
pub mod gen;
pub mod group;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod trainer;

pub use collect::*;
pub use executor::*;
pub use gen::*;
pub use group::*;
pub use pipeline::*;
pub use queue::*;
pub use trainer::*;
