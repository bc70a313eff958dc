pub mod collaborators;
pub mod entities;
pub mod events;
pub mod messaging;
pub mod repositories;

pub use collaborators::*;
pub use entities::*;
pub use events::*;
pub use messaging::*;
pub use repositories::*;

pub use dispatch_errors::{DispatchError, DispatchResult};
