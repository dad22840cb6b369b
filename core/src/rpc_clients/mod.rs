pub mod explorer;
pub mod horizon;
pub mod safe;
pub mod solana;

pub use explorer::{ExplorerClient, ExplorerTx};
pub use horizon::HorizonClient;
pub use safe::SafeTransactionServiceClient;
pub use solana::SolanaRpcClient;
