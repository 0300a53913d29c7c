//! Event signatures and non-indexed payload layouts of the NonfungiblePositionManager,
//! factory and pool contracts.

use alloy::{
    primitives::{B256, b256},
    sol,
};

pub const TRANSFER: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
pub const INCREASE_LIQUIDITY: B256 =
    b256!("3067048beee31b25b2f1681f88dac838c8bba36af25bfb2b7cf7473a5847e35f");
pub const DECREASE_LIQUIDITY: B256 =
    b256!("26f6a048ee9138f2c0ce266f322cb99228e8d619ae2bff30c67f8dcf9d2377b4");
pub const POSITION_COLLECT: B256 =
    b256!("40d0efd1a53d60ecbf40971b9daf7dc90178c3aadc7aab1765632738fa8b8f01");

pub const POOL_MINT: B256 =
    b256!("7a53080ba414158be7ec69b987b5fb7d07dee101fe85488f0853ae16239d0bde");
pub const POOL_BURN: B256 =
    b256!("0c396cd989a39f4459b5fa1aed6a9a8dcdbc45908acfd67e028cd568da98982c");
pub const POOL_SWAP: B256 =
    b256!("c42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67");
pub const POOL_COLLECT: B256 =
    b256!("70935338e69775456a85ddef226c395fb668b63fa0115f5f20610b388e6ca9c0");

pub const POOL_CREATED: B256 =
    b256!("783cca1c0412dd0d695e784568c96da2e9c22ff989357a2e8b1d9b2b4e6b7118");

pub const POSITION_MANAGER_TOPICS: [B256; 4] = [
    TRANSFER,
    INCREASE_LIQUIDITY,
    DECREASE_LIQUIDITY,
    POSITION_COLLECT,
];

pub const POOL_TOPICS: [B256; 4] = [POOL_SWAP, POOL_MINT, POOL_BURN, POOL_COLLECT];

pub const FACTORY_TOPICS: [B256; 1] = [POOL_CREATED];

/// Topic slot holding the position token id for position-manager events.
/// `Transfer(from, to, tokenId)` indexes it third, the liquidity events first.
pub fn token_id_topic(topic0: &B256) -> Option<usize> {
    match Signature::from_topic(topic0)? {
        Signature::Transfer => Some(3),
        Signature::IncreaseLiquidity
        | Signature::DecreaseLiquidity
        | Signature::PositionCollect => Some(1),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Transfer,
    IncreaseLiquidity,
    DecreaseLiquidity,
    PositionCollect,
    PoolSwap,
    PoolMint,
    PoolBurn,
    PoolCollect,
    PoolCreated,
}

impl Signature {
    pub fn from_topic(topic: &B256) -> Option<Self> {
        SIGNATURES
            .iter()
            .find(|(hash, _)| hash == topic)
            .map(|(_, signature)| *signature)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signature::Transfer => "Transfer",
            Signature::IncreaseLiquidity => "IncreaseLiquidity",
            Signature::DecreaseLiquidity => "DecreaseLiquidity",
            Signature::PositionCollect => "Collect",
            Signature::PoolSwap => "Swap",
            Signature::PoolMint => "Mint",
            Signature::PoolBurn => "Burn",
            Signature::PoolCollect => "PoolCollect",
            Signature::PoolCreated => "PoolCreated",
        }
    }
}

const SIGNATURES: [(B256, Signature); 9] = [
    (TRANSFER, Signature::Transfer),
    (INCREASE_LIQUIDITY, Signature::IncreaseLiquidity),
    (DECREASE_LIQUIDITY, Signature::DecreaseLiquidity),
    (POSITION_COLLECT, Signature::PositionCollect),
    (POOL_SWAP, Signature::PoolSwap),
    (POOL_MINT, Signature::PoolMint),
    (POOL_BURN, Signature::PoolBurn),
    (POOL_COLLECT, Signature::PoolCollect),
    (POOL_CREATED, Signature::PoolCreated),
];

sol! {
    // IncreaseLiquidity(uint256 indexed tokenId, uint128 liquidity, uint256 amount0, uint256 amount1)
    // DecreaseLiquidity shares the layout.
    struct LiquidityChangeData {
        uint128 liquidity;
        uint256 amount0;
        uint256 amount1;
    }

    // Collect(uint256 indexed tokenId, address recipient, uint256 amount0, uint256 amount1)
    struct PositionCollectData {
        address recipient;
        uint256 amount0;
        uint256 amount1;
    }

    // Swap(address indexed sender, address indexed recipient, ...)
    struct SwapData {
        int256 amount0;
        int256 amount1;
        uint160 sqrtPriceX96;
        uint128 liquidity;
        int24 tick;
    }

    // Mint(address sender, address indexed owner, int24 indexed tickLower, int24 indexed tickUpper, ...)
    struct PoolMintData {
        address sender;
        uint128 amount;
        uint256 amount0;
        uint256 amount1;
    }

    // Burn(address indexed owner, int24 indexed tickLower, int24 indexed tickUpper, ...)
    struct PoolBurnData {
        uint128 amount;
        uint256 amount0;
        uint256 amount1;
    }

    // Collect(address indexed owner, address recipient, int24 indexed tickLower, int24 indexed tickUpper, ...)
    struct PoolCollectData {
        address recipient;
        uint128 amount0;
        uint128 amount1;
    }

    // PoolCreated(address indexed token0, address indexed token1, uint24 indexed fee, int24 tickSpacing, address pool)
    struct PoolCreatedData {
        int24 tickSpacing;
        address pool;
    }
}
