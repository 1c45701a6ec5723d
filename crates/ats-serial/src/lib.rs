pub mod capture;
pub mod channel;
pub mod error;
pub mod fake;
pub mod link;
pub mod locator;
pub mod recovery;

pub use capture::*;
pub use channel::*;
pub use error::*;
pub use fake::*;
pub use link::*;
pub use locator::*;
pub use recovery::*;
