use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoordinatorError, CoordinatorResult};

/// The name of a task: `<taskPrefix>_<generation>_<randomSuffix>`.
///
/// The prefix itself may contain underscores, so parsing splits on the
/// last two underscores from the right. The generation counts how many
/// times the task has been superseded; the suffix makes names unique so
/// that a successor never collides with its predecessor in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName {
    prefix: String,
    generation: u64,
    suffix: String,
}

impl TaskName {
    /// Mint a fresh task name with generation zero and a random suffix.
    pub fn mint(prefix: impl Into<String>, rng: &mut dyn RngCore) -> Self {
        Self {
            prefix: prefix.into(),
            generation: 0,
            suffix: format!("{:08x}", rng.next_u32()),
        }
    }

    /// Mint the name of a successor task: same prefix, next generation,
    /// new random suffix.
    pub fn successor(&self, rng: &mut dyn RngCore) -> CoordinatorResult<Self> {
        let generation = self
            .generation
            .checked_add(1)
            .ok_or_else(|| CoordinatorError::Internal("task generation overflow".to_string()))?;
        Ok(Self {
            prefix: self.prefix.clone(),
            generation,
            suffix: format!("{:08x}", rng.next_u32()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.prefix, self.generation, self.suffix)
    }
}

impl FromStr for TaskName {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> CoordinatorResult<Self> {
        let mut parts = s.rsplitn(3, '_');
        let (Some(suffix), Some(generation), Some(prefix)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(CoordinatorError::invalid(format!(
                "{s} is not a valid task name"
            )));
        };
        if prefix.is_empty() || suffix.is_empty() {
            return Err(CoordinatorError::invalid(format!(
                "{s} is not a valid task name"
            )));
        }
        let generation = generation
            .parse::<u64>()
            .map_err(|_| CoordinatorError::invalid(format!("{s} is not a valid task name")))?;
        Ok(Self {
            prefix: prefix.to_string(),
            generation,
            suffix: suffix.to_string(),
        })
    }
}

impl Serialize for TaskName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_task_name_round_trip() {
        let name: TaskName = "events_2_00ffa0b1".parse().unwrap();
        assert_eq!(name.prefix(), "events");
        assert_eq!(name.generation(), 2);
        assert_eq!(name.suffix(), "00ffa0b1");
        assert_eq!(name.to_string(), "events_2_00ffa0b1");
    }

    #[test]
    fn test_task_name_prefix_with_underscores() {
        let name: TaskName = "change_capture_orders_11_deadbeef".parse().unwrap();
        assert_eq!(name.prefix(), "change_capture_orders");
        assert_eq!(name.generation(), 11);
        assert_eq!(name.suffix(), "deadbeef");
    }

    #[test]
    fn test_task_name_rejects_malformed_input() {
        assert!("events".parse::<TaskName>().is_err());
        assert!("events_1".parse::<TaskName>().is_err());
        assert!("events_one_abc".parse::<TaskName>().is_err());
        assert!("_1_abc".parse::<TaskName>().is_err());
        assert!("events_1_".parse::<TaskName>().is_err());
    }

    #[test]
    fn test_successor_bumps_generation_and_suffix() {
        let mut rng = StdRng::seed_from_u64(7);
        let name = TaskName::mint("events", &mut rng);
        let successor = name.successor(&mut rng).unwrap();
        assert_eq!(successor.prefix(), name.prefix());
        assert_eq!(successor.generation(), name.generation() + 1);
        assert_ne!(successor.suffix(), name.suffix());
    }

    #[test]
    fn test_minting_is_deterministic_for_a_seed() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        assert_eq!(
            TaskName::mint("events", &mut a),
            TaskName::mint("events", &mut b)
        );
    }
}
