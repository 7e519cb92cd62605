// Contracts Module - read-only bindings for the factory, pool and deposit token

pub mod erc20;
pub mod i_pool;
pub mod i_pool_factory;

pub use erc20::Erc20;
pub use i_pool::{FundingRequest, IPool};
pub use i_pool_factory::IPoolFactory;
