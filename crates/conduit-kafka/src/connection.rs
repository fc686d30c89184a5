use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{KafkaError, KafkaResult};

const PLAIN_SCHEME: &str = "kafka://";
const TLS_SCHEME: &str = "kafkassl://";

/// A single broker endpoint in a message-log connection string.
/// Ordering is by host name first, then numerically by port, which defines
/// the canonical broker list order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> KafkaResult<Self> {
        let host = host.into();
        let trimmed = host.trim();
        if trimmed.is_empty() {
            return Err(KafkaError::InvalidConnectionString(
                "empty broker host".to_string(),
            ));
        }
        if port == 0 {
            return Err(KafkaError::InvalidConnectionString(format!(
                "{port} is not a valid port number"
            )));
        }
        Ok(Self {
            host: trimmed.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = KafkaError;

    fn from_str(s: &str) -> KafkaResult<Self> {
        let s = s.trim();
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(KafkaError::InvalidConnectionString(format!(
                "{s} is not a valid broker address"
            )));
        };
        let port = port.trim().parse::<u16>().map_err(|_| {
            KafkaError::InvalidConnectionString(format!("{s} is not a valid broker address"))
        })?;
        Self::new(host, port)
    }
}

/// A parsed message-log connection string of the form
/// `kafka://host:port[,host:port...]/topic` (or `kafkassl://` for TLS).
/// The broker list is kept in canonical sorted order so that two strings
/// naming the same brokers compare equal regardless of their spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaConnectionString {
    brokers: Vec<BrokerAddress>,
    topic: String,
    tls: bool,
}

impl KafkaConnectionString {
    pub fn new(
        brokers: impl IntoIterator<Item = BrokerAddress>,
        topic: impl Into<String>,
        tls: bool,
    ) -> KafkaResult<Self> {
        let mut brokers: Vec<_> = brokers.into_iter().collect();
        if brokers.is_empty() {
            return Err(KafkaError::InvalidConnectionString(
                "no brokers".to_string(),
            ));
        }
        brokers.sort();
        let topic = topic.into();
        let trimmed = topic.trim();
        if trimmed.is_empty() {
            return Err(KafkaError::InvalidConnectionString(
                "empty topic".to_string(),
            ));
        }
        Ok(Self {
            brokers,
            topic: trimmed.to_string(),
            tls,
        })
    }

    pub fn brokers(&self) -> &[BrokerAddress] {
        &self.brokers
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// The canonical comma-separated broker list without the scheme or topic,
    /// suitable for client bootstrap configuration.
    pub fn broker_list(&self) -> String {
        self.brokers
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for KafkaConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { TLS_SCHEME } else { PLAIN_SCHEME };
        write!(f, "{scheme}{}/{}", self.broker_list(), self.topic)
    }
}

impl FromStr for KafkaConnectionString {
    type Err = KafkaError;

    fn from_str(s: &str) -> KafkaResult<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(KafkaError::InvalidConnectionString(
                "empty connection string".to_string(),
            ));
        }
        let (rest, tls) = if let Some(rest) = trimmed.strip_prefix(TLS_SCHEME) {
            (rest, true)
        } else if let Some(rest) = trimmed.strip_prefix(PLAIN_SCHEME) {
            (rest, false)
        } else {
            return Err(KafkaError::InvalidConnectionString(format!(
                "{trimmed} does not start with {PLAIN_SCHEME} or {TLS_SCHEME}"
            )));
        };
        let Some((brokers, topic)) = rest.split_once('/') else {
            return Err(KafkaError::InvalidConnectionString(format!(
                "{trimmed} has no topic"
            )));
        };
        let brokers = brokers
            .split(',')
            .map(str::parse)
            .collect::<KafkaResult<Vec<BrokerAddress>>>()?;
        Self::new(brokers, topic, tls)
    }
}
