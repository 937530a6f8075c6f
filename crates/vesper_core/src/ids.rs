use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{VesperError, VesperResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; 16]);

impl Id {
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_uuid_str(value: &str) -> VesperResult<Self> {
        let uuid = Uuid::parse_str(value)
            .map_err(|err| VesperError::invalid(format!("invalid uuid '{value}': {err}")))?;
        Ok(Self(*uuid.as_bytes()))
    }

    pub fn to_uuid_string(self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    pub fn as_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = Uuid::from_bytes(self.0);
        write!(f, "{uuid}")
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_uuid_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Id::from_uuid_str(&value).map_err(serde::de::Error::custom)
    }
}

/// Identifies one live subscription across every worker sharing a broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(pub Id);

/// Identifies one broker instance (one worker process) holding leases.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BrokerId(pub Id);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Id::new())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerId {
    pub fn new() -> Self {
        Self(Id::new())
    }
}

impl Default for BrokerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sequence number of a committed mutation, allocated by the broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MutationId(pub i64);

impl MutationId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

macro_rules! id_wrapper_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(Self(Id::deserialize(deserializer)?))
            }
        }
    };
}

id_wrapper_serde!(SubscriptionId);
id_wrapper_serde!(BrokerId);

#[cfg(test)]
mod tests {
    use super::{Id, SubscriptionId};

    #[test]
    fn id_roundtrips_uuid() {
        let id = Id::new();
        let parsed = Id::from_uuid_str(&id.to_uuid_string()).expect("uuid parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn id_rejects_invalid_strings() {
        assert!(Id::from_uuid_str("not-a-uuid").is_err());
    }

    #[test]
    fn subscription_id_serializes_as_plain_uuid() {
        let id = SubscriptionId::new();
        let encoded = serde_json::to_string(&id).expect("encode");
        assert_eq!(encoded, format!("\"{}\"", id.0.to_uuid_string()));
        let decoded: SubscriptionId = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, id);
    }
}
