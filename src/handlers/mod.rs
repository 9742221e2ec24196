pub mod deferred;
pub mod health;
pub mod stats;
pub mod supported;

pub use deferred::*;
pub use health::*;
pub use stats::*;
pub use supported::*;
