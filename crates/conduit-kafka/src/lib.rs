mod connection;

pub use connection::{BrokerAddress, KafkaConnectionString};

use thiserror::Error;

pub type KafkaResult<T> = Result<T, KafkaError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KafkaError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}
