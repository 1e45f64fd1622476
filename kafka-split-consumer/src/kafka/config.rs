use rdkafka::ClientConfig;

/// Kafka consumer configuration builder with defaults for a split consumer.
///
/// Offsets are committed explicitly after partitions drain, so auto commit and
/// auto offset store are always off.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
    tls: bool,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a **group-based consumer**.
    ///
    /// Sets: enable.auto.offset.store=false, enable.auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config, tls: false }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        if enabled {
            self.config.set("security.protocol", "ssl");
        }
        self
    }

    /// Authenticate with SASL/SCRAM-SHA-512.
    ///
    /// Call after `with_tls`: the security protocol is SASL_SSL when TLS is on
    /// and SASL_PLAINTEXT otherwise.
    pub fn with_sasl_scram(mut self, username: &str, password: &str) -> Self {
        let protocol = if self.tls { "sasl_ssl" } else { "sasl_plaintext" };
        self.config
            .set("security.protocol", protocol)
            .set("sasl.mechanism", "SCRAM-SHA-512")
            .set("sasl.username", username)
            .set("sasl.password", password);
        self
    }

    /// Override offset reset policy used when the group has no committed offset
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Bound how long a broker connection may take to establish
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config
            .set("socket.connection.setup.timeout.ms", ms.to_string());
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
