//! Command-line options shared by the ingestion binaries.
//!
//! Every option can also be set through the environment; a `.env` file in
//! the working directory is loaded first.

use std::path::PathBuf;
#[cfg(feature = "kafka")]
use std::time::Duration;

use clap::Args;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "kafka")]
use crate::queue::KafkaConfig;

/// Document store location.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Path to the SQLite document store
    #[arg(long, env = "STORE_PATH", default_value = "./data/melaka.db")]
    pub store_path: PathBuf,
}

/// Kafka connection options.
#[derive(Args, Debug, Clone)]
pub struct KafkaArgs {
    /// Kafka bootstrap brokers (comma-separated)
    #[arg(
        long = "kafka-broker",
        env = "KAFKA_BROKER",
        value_delimiter = ',',
        default_value = "localhost:9092"
    )]
    pub brokers: Vec<String>,

    /// Topic carrying normalized records
    #[arg(long = "kafka-topic", env = "KAFKA_TOPIC", default_value = "nvd-cves")]
    pub topic: String,

    /// SASL/PLAIN username
    #[arg(long = "kafka-username", env = "KAFKA_USERNAME")]
    pub username: Option<String>,

    /// SASL/PLAIN password
    #[arg(long = "kafka-password", env = "KAFKA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Connect to Kafka over TLS
    #[arg(long = "kafka-tls", env = "KAFKA_TLS")]
    pub tls: bool,

    /// Partitions when creating the topic
    #[arg(long = "kafka-partitions", env = "KAFKA_PARTITIONS", default_value = "1")]
    pub partitions: i32,

    /// Seconds a publish may wait for delivery
    #[arg(long = "kafka-send-timeout-secs", default_value = "5")]
    pub send_timeout_secs: u64,
}

#[cfg(feature = "kafka")]
impl KafkaArgs {
    /// Build a client configuration. The consumer group keeps its default.
    pub fn to_config(&self) -> KafkaConfig {
        KafkaConfig {
            brokers: self
                .brokers
                .iter()
                .map(|b| b.trim())
                .filter(|b| !b.is_empty())
                .collect::<Vec<_>>()
                .join(","),
            topic: self.topic.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            tls: self.tls,
            partitions: self.partitions,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            ..Default::default()
        }
    }
}

/// Load `.env` from the working directory, if present.
///
/// Returns the path that was loaded. Call this before parsing arguments so
/// environment-backed options see the file's values.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestArgs {
        #[command(flatten)]
        kafka: KafkaArgs,

        #[command(flatten)]
        store: StoreArgs,
    }

    #[test]
    fn test_defaults() {
        let args = TestArgs::try_parse_from(["melaka"]).unwrap();
        assert_eq!(args.kafka.topic, "nvd-cves");
        assert_eq!(args.store.store_path, PathBuf::from("./data/melaka.db"));
        assert!(!args.kafka.tls);
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn test_multiple_brokers_joined() {
        let args = TestArgs::try_parse_from([
            "melaka",
            "--kafka-broker",
            "k1:9092, k2:9092",
            "--kafka-topic",
            "cves",
        ])
        .unwrap();

        let config = args.kafka.to_config();
        assert_eq!(config.brokers, "k1:9092,k2:9092");
        assert_eq!(config.topic, "cves");
        assert_eq!(config.send_timeout, Duration::from_secs(5));
    }
}
