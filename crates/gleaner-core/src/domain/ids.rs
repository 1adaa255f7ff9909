//! Domain identifiers (strongly-typed IDs).
//!
//! すべての ID は ULID ベースの `Id<T>` で表現します。
//! `T` は PhantomData のマーカー型で、JobId と CandidateId のような
//! 異なるエンティティの ID をコンパイル時に混同できないようにします。
//!
//! ULID は生成順にソート可能なので、同時刻に作られた候補の
//! primary 選択（古い方を primary にする）の tie-break にも使えます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "cand-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parses both the prefixed display form (`job-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

macro_rules! id_marker {
    ($marker:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(Job, "job-");
id_marker!(Discovery, "disc-");
id_marker!(Candidate, "cand-");
id_marker!(Posting, "post-");
id_marker!(Decision, "merge-");
id_marker!(Event, "evt-");

/// Identifier of a ledger job.
pub type JobId = Id<Job>;

/// Identifier of a raw intake record.
pub type DiscoveryId = Id<Discovery>;

/// Identifier of a posting-in-progress.
pub type CandidateId = Id<Candidate>;

/// Identifier of a published posting.
pub type PostingId = Id<Posting>;

/// Identifier of a recorded merge decision.
pub type DecisionId = Id<Decision>;

/// Identifier of a provenance event.
pub type EventId = Id<Event>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid = Ulid::new();
        let job = JobId::from_ulid(ulid);
        let cand = CandidateId::from_ulid(ulid);

        assert_eq!(job.as_ulid(), cand.as_ulid());
        assert!(job.to_string().starts_with("job-"));
        assert!(cand.to_string().starts_with("cand-"));
        // let _: JobId = cand; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_bare_ulid_strings() {
        let id = PostingId::from_ulid(Ulid::new());
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", id.as_ulid()));

        let back: PostingId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let id = DiscoveryId::from_ulid(Ulid::new());
        let prefixed: DiscoveryId = id.to_string().parse().unwrap();
        let bare: DiscoveryId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
        assert!("disc-not-a-ulid".parse::<DiscoveryId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<EventId>(), 16);
    }
}
