pub mod abi;
pub mod reader;
pub mod rpc;
pub mod signer;

// Re-exports for convenience
pub use abi::{keccak256, Token};
pub use reader::{ChainReader, RpcChainReader};
pub use rpc::{RpcError, RpcPool};
pub use signer::{recover_signer, LocalKeySigner, Signer, SignerError};
