pub mod backoff;
pub mod clock;
pub mod events;
pub mod ids;
pub mod model;
pub mod types;

pub use backoff::*;
pub use clock::*;
pub use events::*;
pub use ids::*;
pub use model::*;
pub use types::*;
