/// Identifies what to consume and on behalf of whom.
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    /// Consumer group. Namespaces checkpoints so independent consumers
    /// of the same stream keep separate progress.
    pub group: String,
    /// Stream to consume.
    pub stream: String,
    /// Transport settings for the Kinesis endpoint.
    pub aws: AwsConfig,
}

/// Transport settings. Empty fields defer to the SDK defaults.
#[derive(Debug, Clone, Default)]
pub struct AwsConfig {
    /// Custom Kinesis endpoint, e.g. a localstack URL. Empty means the
    /// stock AWS endpoint for the resolved region.
    pub endpoint: String,
    /// AWS region. Empty falls back to the default provider chain
    /// (AWS_REGION and friends).
    pub region: String,
}
