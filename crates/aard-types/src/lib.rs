pub mod approval;
pub mod capability;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod plan;
pub mod reflection;
pub mod workflow;

pub use approval::*;
pub use capability::*;
pub use checkpoint::*;
pub use error::*;
pub use event::*;
pub use plan::*;
pub use reflection::*;
pub use workflow::*;
