//! Chain state access traits and transaction validation.

pub mod context;
pub mod crypto;
pub mod memory;
pub mod programs;
pub mod store;
pub mod validation;

pub use context::ValidationContext;
pub use memory::MemoryChainState;
pub use store::{ChainEngine, ChainStore, StoreError};
pub use validation::{
    check_transaction_context, check_transaction_sanity, RuleError, RuleErrorKind,
};
