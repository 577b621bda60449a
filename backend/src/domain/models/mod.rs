pub mod child;
pub mod transaction;

pub use child::{AllowanceConfig, ChildLedger, Family, MarkerField};
pub use transaction::{LedgerTransaction, NewTransaction};
