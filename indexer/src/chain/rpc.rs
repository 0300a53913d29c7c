use std::{collections::BTreeMap, sync::Arc};

use alloy::{
    primitives::{Address, B256, Bytes, TxKind},
    providers::{Provider, RootProvider},
    rpc::{
        client::RpcClient,
        types::{Filter, Log, TransactionInput, TransactionRequest},
    },
    transports::{
        RpcError, TransportError, TransportErrorKind,
        http::{Http, reqwest::Url},
    },
};
use async_trait::async_trait;

use super::{LogFilter, LogSource, sanitize_endpoint};
use crate::{decoder::abi, error::SourceError, types::LogRecord};

/// `LogSource` backed by an alloy HTTP provider.
#[derive(Debug, Clone)]
pub struct RpcLogSource {
    client: Arc<RootProvider>,
    label: String,
}

impl RpcLogSource {
    pub fn new(rpc_url: &str) -> Result<Self, SourceError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| SourceError::Transport(format!("invalid endpoint url: {e}")))?;
        let transport = Http::new(url);
        let provider = RootProvider::new(RpcClient::new(transport, false));

        Ok(Self {
            client: Arc::new(provider),
            label: sanitize_endpoint(rpc_url),
        })
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    fn endpoint(&self) -> &str {
        &self.label
    }

    async fn head_block(&self) -> Result<u64, SourceError> {
        Ok(self.client.get_block_number().await?)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError> {
        let base = Filter::new()
            .from_block(filter.from_block)
            .to_block(filter.to_block)
            .address(filter.addresses.clone());

        if filter.token_ids.is_empty() {
            let logs = self
                .client
                .get_logs(&base.event_signature(filter.topics.clone()))
                .await?;
            return logs.into_iter().map(into_record).collect();
        }

        // One query per token slot; signatures without a token topic are skipped.
        let words: Vec<B256> = filter.token_ids.iter().map(|id| B256::from(*id)).collect();
        let mut by_slot: BTreeMap<usize, Vec<B256>> = BTreeMap::new();
        for topic in &filter.topics {
            if let Some(slot) = abi::token_id_topic(topic) {
                by_slot.entry(slot).or_default().push(*topic);
            }
        }

        let mut records = Vec::new();
        for (slot, topics) in by_slot {
            let query = base.clone().event_signature(topics);
            let query = match slot {
                1 => query.topic1(words.clone()),
                2 => query.topic2(words.clone()),
                _ => query.topic3(words.clone()),
            };
            for log in self.client.get_logs(&query).await? {
                records.push(into_record(log)?);
            }
        }
        records.sort_by_key(|r| (r.block_number, r.log_index));
        Ok(records)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
        let block = self
            .client
            .get_block(block_number.into())
            .await?
            .ok_or_else(|| SourceError::Malformed(format!("block {block_number} not found")))?;
        Ok(block.header.timestamp)
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, SourceError> {
        let tx = TransactionRequest {
            to: Some(TxKind::Call(to)),
            input: TransactionInput::new(input),
            ..Default::default()
        };
        Ok(self.client.call(tx).await?)
    }
}

fn into_record(log: Log) -> Result<LogRecord, SourceError> {
    let block_number = log
        .block_number
        .ok_or_else(|| SourceError::Malformed("log without block number".into()))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| SourceError::Malformed("log without transaction hash".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| SourceError::Malformed("log without log index".into()))?;

    Ok(LogRecord {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_number,
        transaction_hash,
        log_index,
    })
}

impl From<TransportError> for SourceError {
    fn from(err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => SourceError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            RpcError::Transport(TransportErrorKind::HttpError(http)) => SourceError::Http {
                status: http.status,
                body: http.body,
            },
            RpcError::NullResp => SourceError::Malformed("null response".into()),
            RpcError::DeserError { err, .. } => SourceError::Malformed(err.to_string()),
            other => SourceError::Transport(other.to_string()),
        }
    }
}
