pub mod gateway;
pub mod subscriber;
pub mod types;

pub use gateway::{RpcGateway, RpcHealth, SolanaRpcGateway};
pub use subscriber::LogSubscriber;
