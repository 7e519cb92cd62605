use ethers::prelude::*;

abigen!(
    IPoolFactory,
    r#"[
        event PoolCreated(address indexed pool, address indexed admin, string name)
        function getAllPools() external view returns (address[])
    ]"#
);
