pub mod aggregation;
pub mod analytics;
pub mod balance;
pub mod chain;
pub mod context_decoder;
pub mod nonce_ledger;
pub mod settlement;
pub mod store;
pub mod validator;
pub mod verification;

pub use aggregation::{AggregationPolicy, AggregationScope};
pub use analytics::Analytics;
pub use balance::BalanceQuery;
pub use chain::{ChainClient, EthersChainClient};
pub use context_decoder::{decode_user_context, UserContext};
pub use nonce_ledger::NonceLedger;
pub use settlement::{SettlementOrchestrator, SettlementState};
pub use store::{MemoryVoucherStore, RedisVoucherStore, VoucherStore};
pub use validator::VoucherValidator;
pub use verification::{VerificationService, VerifyState};
