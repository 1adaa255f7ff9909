//! IdGenerator port - ID 生成の抽象化
//!
//! ULID の timestamp 部分は Clock から取るので、FixedClock を使うと
//! 同一時刻の ID が生成されます（ランダム部分で一意性は保たれる）。

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;
}

/// Typed convenience over any generator.
pub fn next_id<T: IdMarker>(ids: &dyn IdGenerator) -> Id<T> {
    Id::from_ulid(ids.next_ulid())
}

/// ULID generator stamped from a `Clock`.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl IdGenerator for UlidGenerator {
    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{CandidateId, JobId};
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let ids = UlidGenerator::new(Arc::new(SystemClock));
        let a: JobId = next_id(&ids);
        let b: JobId = next_id(&ids);
        assert_ne!(a, b);
    }

    #[test]
    fn timestamp_comes_from_clock() {
        let fixed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(Arc::new(FixedClock::new(fixed)));
        let a: CandidateId = next_id(&ids);
        let b: CandidateId = next_id(&ids);
        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
    }
}
