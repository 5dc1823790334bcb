pub mod chain; // bitcoin settlement layer (Esplora REST)
pub mod ledger; // contract ledger via indexer REST gateway

pub use chain::{ChainSource, EsploraClient};
pub use ledger::{HttpLedgerClient, LedgerSource};
