use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusoto_core::{Region, RusotoError};
use rusoto_kinesis::{
    GetRecordsInput, GetShardIteratorInput, Kinesis, KinesisClient, ListShardsInput,
};

use crate::config::AwsConfig;
use crate::error::{ClientError, ConsumerError};
use crate::interface::client::{IteratorPosition, RecordBatch, Shard, StreamClient, StreamRecord};

/// [`StreamClient`] backed by the AWS Kinesis API.
pub struct KinesisStreamClient {
    inner: KinesisClient,
}

impl KinesisStreamClient {
    /// Build a client for the endpoint/region described by `aws`. A
    /// non-empty endpoint selects a custom endpoint (e.g. localstack);
    /// otherwise the region is resolved by name, falling back to the
    /// default provider chain when empty.
    pub fn new(aws: &AwsConfig) -> Result<Self, ConsumerError> {
        Ok(KinesisStreamClient {
            inner: KinesisClient::new(resolve_region(aws)?),
        })
    }
}

fn resolve_region(aws: &AwsConfig) -> Result<Region, ConsumerError> {
    if !aws.endpoint.is_empty() {
        let name = if aws.region.is_empty() {
            Region::default().name().to_owned()
        } else {
            aws.region.clone()
        };
        return Ok(Region::Custom {
            name,
            endpoint: aws.endpoint.trim_end_matches('/').to_owned(),
        });
    }
    if aws.region.is_empty() {
        return Ok(Region::default());
    }
    Region::from_str(&aws.region)
        .map_err(|err| ConsumerError::Config(format!("unknown region {:?}: {}", aws.region, err)))
}

/// Sort a service failure into retry-next-tick versus report-loudly.
fn classify<E: std::error::Error + 'static>(err: RusotoError<E>) -> ClientError {
    match err {
        RusotoError::ParseError(message) => ClientError::Protocol(message),
        RusotoError::Validation(message) => ClientError::Protocol(message),
        RusotoError::Unknown(response) if !response.status.is_server_error() => {
            ClientError::Protocol(format!(
                "unexpected response status {}: {}",
                response.status,
                String::from_utf8_lossy(&response.body),
            ))
        }
        other => ClientError::Transient(other.to_string()),
    }
}

fn convert_shard(shard: rusoto_kinesis::Shard) -> Shard {
    let parent_ids = [shard.parent_shard_id, shard.adjacent_parent_shard_id]
        .into_iter()
        .flatten()
        .collect();
    Shard {
        id: shard.shard_id,
        parent_ids,
    }
}

fn convert_record(record: rusoto_kinesis::Record) -> StreamRecord {
    StreamRecord {
        partition_key: record.partition_key,
        data: record.data,
        sequence_number: record.sequence_number,
        timestamp: arrival_timestamp(record.approximate_arrival_timestamp),
    }
}

/// Kinesis reports arrival times as fractional epoch seconds.
fn arrival_timestamp(seconds: Option<f64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|s| Utc.timestamp_millis_opt((s * 1000.0) as i64).single())
}

fn iterator_request(stream: &str, shard_id: &str, position: IteratorPosition) -> GetShardIteratorInput {
    let (shard_iterator_type, starting_sequence_number) = match position {
        IteratorPosition::TrimHorizon => ("TRIM_HORIZON", None),
        IteratorPosition::Latest => ("LATEST", None),
        IteratorPosition::AtSequenceNumber(sequence) => ("AT_SEQUENCE_NUMBER", Some(sequence)),
        IteratorPosition::AfterSequenceNumber(sequence) => {
            ("AFTER_SEQUENCE_NUMBER", Some(sequence))
        }
    };
    GetShardIteratorInput {
        shard_id: shard_id.to_owned(),
        shard_iterator_type: shard_iterator_type.to_owned(),
        starting_sequence_number,
        stream_name: stream.to_owned(),
        timestamp: None,
    }
}

#[async_trait]
impl StreamClient for KinesisStreamClient {
    async fn list_shards(&self, stream: &str) -> Result<Vec<Shard>, ClientError> {
        let mut shards = Vec::new();
        let mut request = ListShardsInput {
            stream_name: Some(stream.to_owned()),
            ..Default::default()
        };
        loop {
            let response = self.inner.list_shards(request).await.map_err(classify)?;
            shards.extend(
                response
                    .shards
                    .unwrap_or_default()
                    .into_iter()
                    .map(convert_shard),
            );
            match response.next_token {
                // The API rejects a stream name alongside a pagination
                // token.
                Some(next_token) => {
                    request = ListShardsInput {
                        next_token: Some(next_token),
                        ..Default::default()
                    };
                }
                None => return Ok(shards),
            }
        }
    }

    async fn get_shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<String, ClientError> {
        let response = self
            .inner
            .get_shard_iterator(iterator_request(stream, shard_id, position))
            .await
            .map_err(classify)?;
        response.shard_iterator.ok_or_else(|| {
            ClientError::Protocol(format!(
                "shard iterator missing from response for shard {shard_id}"
            ))
        })
    }

    async fn get_records(&self, iterator: &str) -> Result<RecordBatch, ClientError> {
        let response = self
            .inner
            .get_records(GetRecordsInput {
                limit: None,
                shard_iterator: iterator.to_owned(),
            })
            .await
            .map_err(classify)?;
        Ok(RecordBatch {
            records: response.records.into_iter().map(convert_record).collect(),
            next_iterator: response.next_shard_iterator,
            millis_behind_latest: response.millis_behind_latest,
        })
    }
}
