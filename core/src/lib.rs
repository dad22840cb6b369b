pub mod chain;
pub mod constants;
pub mod donation;
pub mod error;
pub mod rpc_clients;
pub mod tokens;
