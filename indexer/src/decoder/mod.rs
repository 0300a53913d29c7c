use std::collections::HashMap;

use alloy::{
    primitives::{Address, B256, I256, U256},
    sol_types::SolType,
};

use crate::{
    error::DecodeError,
    types::{
        DecodedEvent, EventDetail, EventMetadata, LogRecord, PoolEvent, PoolEventName,
        PositionEvent, PositionEventType, Transfer,
    },
};

pub mod abi;

use abi::{
    LiquidityChangeData, PoolBurnData, PoolCollectData, PoolCreatedData, PoolMintData,
    PositionCollectData, Signature, SwapData,
};

/// Decodes one raw log. Unknown signatures, and ERC-20 `Transfer`s that share the
/// NFT `Transfer` signature, yield `Ok(None)`.
pub fn decode(log: &LogRecord) -> Result<Option<DecodedEvent>, DecodeError> {
    let Some(signature) = log.topics.first().and_then(Signature::from_topic) else {
        return Ok(None);
    };

    let ctx = Ctx { log, signature };
    let event = match signature {
        Signature::Transfer => {
            // ERC-20 transfers carry the amount in data and only three topics.
            if log.topics.len() < 4 {
                return Ok(None);
            }
            ctx.transfer()?
        }
        Signature::IncreaseLiquidity => ctx.liquidity_change(PositionEventType::Increase)?,
        Signature::DecreaseLiquidity => ctx.liquidity_change(PositionEventType::Decrease)?,
        Signature::PositionCollect => ctx.position_collect()?,
        Signature::PoolSwap => ctx.swap()?,
        Signature::PoolMint => ctx.pool_mint()?,
        Signature::PoolBurn => ctx.pool_burn()?,
        Signature::PoolCollect => ctx.pool_collect()?,
        Signature::PoolCreated => ctx.pool_created()?,
    };
    Ok(Some(event))
}

/// Decodes a window's logs in order, failing on the first malformed payload,
/// then classifies position-opening deposits.
pub fn decode_batch(logs: &[LogRecord]) -> Result<Vec<DecodedEvent>, DecodeError> {
    let mut events = logs
        .iter()
        .filter_map(|log| decode(log).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    classify_mints(&mut events);
    Ok(events)
}

/// Marks `IncreaseLiquidity` events as `MINT` when the same transaction also
/// transferred that token from the zero address.
pub fn classify_mints(events: &mut [DecodedEvent]) {
    let minted: HashMap<(B256, U256), Address> = events
        .iter()
        .filter_map(|event| match event {
            DecodedEvent::Transfer(t) if t.from == Address::ZERO => {
                Some(((t.tx_hash, t.token_id), t.to))
            }
            _ => None,
        })
        .collect();

    if minted.is_empty() {
        return;
    }

    for event in events.iter_mut() {
        if let DecodedEvent::Position(position) = event {
            if position.event_type != PositionEventType::Increase {
                continue;
            }
            if let Some(owner) = minted.get(&(position.tx_hash, position.token_id)) {
                position.event_type = PositionEventType::Mint;
                position.metadata.detail = EventDetail::Mint { owner: *owner };
            }
        }
    }
}

/// Price of token0 in token1 raw units: `(sqrtPriceX96 / 2^96)^2`.
pub fn price_from_sqrt_x96(sqrt_price_x96: U256) -> f64 {
    let sqrt = u256_to_f64(sqrt_price_x96) / 2f64.powi(96);
    sqrt * sqrt
}

fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 2f64.powi(64) + limb as f64)
}

struct Ctx<'a> {
    log: &'a LogRecord,
    signature: Signature,
}

impl Ctx<'_> {
    fn error(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError {
            event: self.signature.name(),
            id: self.log.id(),
            reason: reason.into(),
        }
    }

    fn topic(&self, index: usize) -> Result<B256, DecodeError> {
        self.log
            .topics
            .get(index)
            .copied()
            .ok_or_else(|| self.error(format!("missing topic {index}")))
    }

    fn topic_address(&self, index: usize) -> Result<Address, DecodeError> {
        Ok(Address::from_word(self.topic(index)?))
    }

    fn topic_uint(&self, index: usize) -> Result<U256, DecodeError> {
        Ok(U256::from_be_bytes(self.topic(index)?.0))
    }

    /// An `int24` padded to a full word: the low four bytes hold the value and
    /// the upper bytes must be its sign extension.
    fn topic_tick(&self, index: usize) -> Result<i32, DecodeError> {
        let word = self.topic(index)?;
        let mut low = [0u8; 4];
        low.copy_from_slice(&word[28..]);
        let tick = i32::from_be_bytes(low);
        let fill = if tick < 0 { 0xff } else { 0x00 };
        if word[..28].iter().any(|&b| b != fill) || !(-(1 << 23)..(1 << 23)).contains(&tick) {
            return Err(self.error(format!("topic {index} is not an int24")));
        }
        Ok(tick)
    }

    fn data<T: SolType>(&self) -> Result<T::RustType, DecodeError> {
        T::abi_decode(&self.log.data).map_err(|e| self.error(format!("bad payload: {e}")))
    }

    fn signed(&self, value: U256) -> Result<I256, DecodeError> {
        I256::try_from(value).map_err(|_| self.error("amount exceeds int256"))
    }

    fn transfer(&self) -> Result<DecodedEvent, DecodeError> {
        let from = self.topic_address(1)?;
        let to = self.topic_address(2)?;
        let token_id = self.topic_uint(3)?;

        Ok(DecodedEvent::Transfer(Transfer {
            token_id,
            from,
            to,
            block_number: self.log.block_number,
            tx_hash: self.log.transaction_hash,
            log_index: self.log.log_index,
            timestamp: None,
            metadata: EventMetadata::new(EventDetail::Transfer {
                mint: from == Address::ZERO,
                burn: to == Address::ZERO,
            }),
        }))
    }

    fn position(
        &self,
        event_type: PositionEventType,
        detail: EventDetail,
    ) -> Result<PositionEvent, DecodeError> {
        Ok(PositionEvent {
            token_id: self.topic_uint(1)?,
            pool: None,
            event_type,
            block_number: self.log.block_number,
            tx_hash: self.log.transaction_hash,
            log_index: self.log.log_index,
            timestamp: None,
            tick_lower: None,
            tick_upper: None,
            liquidity_delta: None,
            amount0: None,
            amount1: None,
            price: None,
            usd_value: None,
            metadata: EventMetadata::new(detail),
        })
    }

    fn liquidity_change(&self, event_type: PositionEventType) -> Result<DecodedEvent, DecodeError> {
        let data = self.data::<LiquidityChangeData>()?;
        let detail = match event_type {
            PositionEventType::Decrease => EventDetail::Decrease,
            _ => EventDetail::Increase,
        };
        let liquidity =
            i128::try_from(data.liquidity).map_err(|_| self.error("liquidity exceeds int128"))?;
        let mut event = self.position(event_type, detail)?;
        event.liquidity_delta = Some(match event_type {
            PositionEventType::Decrease => -liquidity,
            _ => liquidity,
        });
        event.amount0 = Some(data.amount0);
        event.amount1 = Some(data.amount1);
        Ok(DecodedEvent::Position(event))
    }

    fn position_collect(&self) -> Result<DecodedEvent, DecodeError> {
        let data = self.data::<PositionCollectData>()?;
        let mut event = self.position(
            PositionEventType::Collect,
            EventDetail::Collect {
                recipient: data.recipient,
            },
        )?;
        event.amount0 = Some(data.amount0);
        event.amount1 = Some(data.amount1);
        Ok(DecodedEvent::Position(event))
    }

    fn pool_event(&self, event_name: PoolEventName, detail: EventDetail) -> PoolEvent {
        PoolEvent {
            pool: self.log.address,
            event_name,
            block_number: self.log.block_number,
            tx_hash: self.log.transaction_hash,
            log_index: self.log.log_index,
            timestamp: None,
            sender: None,
            owner: None,
            recipient: None,
            tick_lower: None,
            tick_upper: None,
            tick: None,
            liquidity: None,
            amount: None,
            amount0: None,
            amount1: None,
            sqrt_price_x96: None,
            price: None,
            metadata: EventMetadata::new(detail),
        }
    }

    fn swap(&self) -> Result<DecodedEvent, DecodeError> {
        let sender = self.topic_address(1)?;
        let recipient = self.topic_address(2)?;
        let data = self.data::<SwapData>()?;
        let sqrt_price_x96 = U256::from(data.sqrtPriceX96);
        let tick = i32::try_from(data.tick).map_err(|_| self.error("tick out of range"))?;

        let mut event = self.pool_event(
            PoolEventName::Swap,
            EventDetail::Swap { sender, recipient },
        );
        event.sender = Some(sender);
        event.recipient = Some(recipient);
        event.amount0 = Some(data.amount0);
        event.amount1 = Some(data.amount1);
        event.liquidity = Some(data.liquidity);
        event.tick = Some(tick);
        event.sqrt_price_x96 = Some(sqrt_price_x96);
        event.price = Some(price_from_sqrt_x96(sqrt_price_x96));
        Ok(DecodedEvent::Pool(event))
    }

    fn pool_mint(&self) -> Result<DecodedEvent, DecodeError> {
        let owner = self.topic_address(1)?;
        let tick_lower = self.topic_tick(2)?;
        let tick_upper = self.topic_tick(3)?;
        let data = self.data::<PoolMintData>()?;

        let mut event = self.pool_event(
            PoolEventName::Mint,
            EventDetail::PoolMint {
                sender: data.sender,
                owner,
            },
        );
        event.sender = Some(data.sender);
        event.owner = Some(owner);
        event.tick_lower = Some(tick_lower);
        event.tick_upper = Some(tick_upper);
        event.amount = Some(data.amount);
        event.amount0 = Some(self.signed(data.amount0)?);
        event.amount1 = Some(self.signed(data.amount1)?);
        Ok(DecodedEvent::Pool(event))
    }

    fn pool_burn(&self) -> Result<DecodedEvent, DecodeError> {
        let owner = self.topic_address(1)?;
        let tick_lower = self.topic_tick(2)?;
        let tick_upper = self.topic_tick(3)?;
        let data = self.data::<PoolBurnData>()?;

        let mut event = self.pool_event(PoolEventName::Burn, EventDetail::PoolBurn { owner });
        event.owner = Some(owner);
        event.tick_lower = Some(tick_lower);
        event.tick_upper = Some(tick_upper);
        event.amount = Some(data.amount);
        event.amount0 = Some(self.signed(data.amount0)?);
        event.amount1 = Some(self.signed(data.amount1)?);
        Ok(DecodedEvent::Pool(event))
    }

    fn pool_collect(&self) -> Result<DecodedEvent, DecodeError> {
        let owner = self.topic_address(1)?;
        let tick_lower = self.topic_tick(2)?;
        let tick_upper = self.topic_tick(3)?;
        let data = self.data::<PoolCollectData>()?;

        let mut event = self.pool_event(
            PoolEventName::Collect,
            EventDetail::PoolCollect {
                owner,
                recipient: data.recipient,
            },
        );
        event.owner = Some(owner);
        event.recipient = Some(data.recipient);
        event.tick_lower = Some(tick_lower);
        event.tick_upper = Some(tick_upper);
        event.amount0 = Some(I256::from_raw(U256::from(data.amount0)));
        event.amount1 = Some(I256::from_raw(U256::from(data.amount1)));
        Ok(DecodedEvent::Pool(event))
    }

    /// Factory log announcing a new pool; stored under the pool's own address.
    fn pool_created(&self) -> Result<DecodedEvent, DecodeError> {
        let token0 = self.topic_address(1)?;
        let token1 = self.topic_address(2)?;
        let fee = self.topic_uint(3)?;
        let fee = u32::try_from(fee)
            .ok()
            .filter(|fee| *fee < 1 << 24)
            .ok_or_else(|| self.error("fee is not a uint24"))?;
        let data = self.data::<PoolCreatedData>()?;
        let tick_spacing =
            i32::try_from(data.tickSpacing).map_err(|_| self.error("tick spacing out of range"))?;

        let mut event = self.pool_event(
            PoolEventName::PoolCreated,
            EventDetail::PoolCreated {
                factory: self.log.address,
                token0,
                token1,
                fee,
                tick_spacing,
            },
        );
        event.pool = data.pool;
        Ok(DecodedEvent::Pool(event))
    }
}
