pub mod amount;
pub mod network;
pub mod response;
pub mod settlement;
pub mod voucher;

pub use network::*;
pub use response::*;
pub use settlement::*;
pub use voucher::*;
