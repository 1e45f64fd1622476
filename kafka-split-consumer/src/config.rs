use std::fmt;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::client::SplitConsumerConfig;
use crate::error::ConsumerError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::group_client::KafkaGroupClientConfig;
use crate::kafka::partition_worker::PartitionWorkerConfig;
use crate::poll_loop::PollLoopConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_sasl_user: Option<String>,

    pub kafka_sasl_password: Option<String>,

    // Defaults to "{kafka_sasl_user}-{service_name}", or the service name without SASL
    pub kafka_consumer_group: Option<String>,

    // Comma-separated
    #[envconfig(default = "inbound-emails")]
    pub kafka_consumer_topics: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "split-consumer")]
    pub service_name: String,

    // Consumer processing configuration
    #[envconfig(default = "10000")]
    pub max_poll_records: usize,

    #[envconfig(default = "5")]
    pub partition_queue_depth: usize,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "5")]
    pub commit_interval_secs: u64,

    #[envconfig(default = "10")]
    pub connect_timeout_secs: u64,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("kafka_hosts", &self.kafka_hosts)
            .field("kafka_tls", &self.kafka_tls)
            .field("kafka_sasl_user", &self.kafka_sasl_user)
            .field(
                "kafka_sasl_password",
                &self.kafka_sasl_password.as_ref().map(|_| "<redacted>"),
            )
            .field("kafka_consumer_group", &self.consumer_group())
            .field("kafka_consumer_topics", &self.topics())
            .field("kafka_consumer_offset_reset", &self.kafka_consumer_offset_reset)
            .field("service_name", &self.service_name)
            .field("max_poll_records", &self.max_poll_records)
            .field("partition_queue_depth", &self.partition_queue_depth)
            .field("poll_timeout_ms", &self.poll_timeout_ms)
            .field("commit_interval_secs", &self.commit_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.topics().is_empty() {
            return Err(ConsumerError::InvalidArgument(
                "KAFKA_CONSUMER_TOPICS must name at least one topic".to_string(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(ConsumerError::InvalidArgument(
                "MAX_POLL_RECORDS must be positive".to_string(),
            ));
        }
        if self.partition_queue_depth == 0 {
            return Err(ConsumerError::InvalidArgument(
                "PARTITION_QUEUE_DEPTH must be positive".to_string(),
            ));
        }
        if self.kafka_sasl_user.is_some() != self.kafka_sasl_password.is_some() {
            return Err(ConsumerError::InvalidArgument(
                "KAFKA_SASL_USER and KAFKA_SASL_PASSWORD must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Topics to consume, trimmed, without empty entries
    pub fn topics(&self) -> Vec<String> {
        self.kafka_consumer_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn consumer_group(&self) -> String {
        match (&self.kafka_consumer_group, &self.kafka_sasl_user) {
            (Some(group), _) if !group.is_empty() => group.clone(),
            (_, Some(user)) => format!("{}-{}", user, self.service_name),
            _ => self.service_name.clone(),
        }
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn split_consumer_config(&self) -> SplitConsumerConfig {
        SplitConsumerConfig {
            poll: PollLoopConfig {
                max_poll_records: self.max_poll_records,
                commit_interval: self.commit_interval(),
            },
            worker: PartitionWorkerConfig {
                queue_depth: self.partition_queue_depth,
            },
        }
    }

    pub fn group_client_config(&self) -> KafkaGroupClientConfig {
        KafkaGroupClientConfig {
            poll_timeout: self.poll_timeout(),
            connect_timeout: self.connect_timeout(),
            close_timeout: self.shutdown_timeout(),
        }
    }

    pub fn build_client_config(&self) -> ClientConfig {
        let mut builder =
            ConsumerConfigBuilder::for_group_consumer(&self.kafka_hosts, &self.consumer_group())
                .with_tls(self.kafka_tls)
                .with_offset_reset(&self.kafka_consumer_offset_reset)
                .with_connect_timeout_ms(self.connect_timeout_secs * 1000)
                .with_client_id(&self.service_name);

        if let (Some(user), Some(password)) = (&self.kafka_sasl_user, &self.kafka_sasl_password) {
            builder = builder.with_sasl_scram(user, password);
        }

        builder.build()
    }
}
