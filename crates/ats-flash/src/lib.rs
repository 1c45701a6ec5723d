pub mod flasher;
pub mod scripted;
pub mod tool;

pub use flasher::*;
pub use scripted::*;
pub use tool::*;
