use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Microseconds since the epoch in the upper bits, a logical counter in the
/// lower bits. Strictly increasing within one process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(pub i64);

const COUNTER_BITS: u32 = 12;
const COUNTER_MASK: u64 = (1u64 << COUNTER_BITS) - 1;

static LAST_TIMESTAMP: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

fn physical_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let physical = physical_micros();
        let mut guard = match LAST_TIMESTAMP.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let last = *guard;
        let last_physical = last >> COUNTER_BITS;
        let last_counter = last & COUNTER_MASK;
        let (next_physical, next_counter) = if physical > last_physical {
            (physical, 0)
        } else if last_counter < COUNTER_MASK {
            (last_physical, last_counter + 1)
        } else {
            (last_physical + 1, 0)
        };
        let next = (next_physical << COUNTER_BITS) | next_counter;
        *guard = next;
        Timestamp(next as i64)
    }

    pub fn from_physical_micros(micros: i64) -> Self {
        Timestamp(micros << COUNTER_BITS)
    }

    pub fn physical_micros(self) -> i64 {
        self.0 >> COUNTER_BITS
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn from_i64(value: i64) -> Self {
        Timestamp(value)
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        let micros = self
            .physical_micros()
            .saturating_sub(duration.as_micros() as i64);
        Timestamp::from_physical_micros(micros.max(0))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = self
            .physical_micros()
            .saturating_add(duration.as_micros() as i64);
        Timestamp::from_physical_micros(micros)
    }

    /// Elapsed wall time from `self` to `later`, zero when `later` is earlier.
    pub fn elapsed_until(self, later: Timestamp) -> Duration {
        let delta = later.physical_micros() - self.physical_micros();
        Duration::from_micros(delta.max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.physical_micros())
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Ok(Timestamp(value))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Timestamp;

    #[test]
    fn now_is_strictly_increasing() {
        let mut previous = Timestamp::now();
        for _ in 0..1_000 {
            let next = Timestamp::now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn physical_arithmetic_drops_the_counter() {
        let base = Timestamp::from_physical_micros(10_000_000);
        let later = base.saturating_add(Duration::from_secs(2));
        assert_eq!(later.physical_micros(), 12_000_000);
        assert_eq!(base.elapsed_until(later), Duration::from_secs(2));
        assert_eq!(later.elapsed_until(base), Duration::ZERO);
        assert_eq!(base.saturating_sub(Duration::from_secs(60)), Timestamp::EPOCH);
    }
}
