pub mod deferred_settlement;

pub use deferred_settlement::DeferredSettlement;
