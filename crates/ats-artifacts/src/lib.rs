pub mod evidence;
pub mod junit;
pub mod meta;
pub mod metrics;
pub mod report;
pub mod summary;

pub use evidence::*;
pub use junit::*;
pub use meta::*;
pub use metrics::*;
pub use report::*;
pub use summary::*;
