//! PostingCandidate - 公開前の posting 候補

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CandidateId, PostingId};

/// Candidate lifecycle.
///
/// - Discovered -> Processed -> {Publishable | NeedsReview | Rejected}
/// - Publishable -> Published (posting created)
/// - NeedsReview -> {Publishable | Rejected} (moderator)
/// - Published -> {Closed | Archived} (posting lifecycle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    Discovered,
    Processed,
    Publishable,
    Published,
    Rejected,
    Closed,
    Archived,
    NeedsReview,
}

impl CandidateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CandidateState::Rejected | CandidateState::Closed | CandidateState::Archived
        )
    }

    /// Edges of the normal lifecycle. Overrides bypass this table.
    pub fn can_transition_to(self, next: CandidateState) -> bool {
        use CandidateState::*;
        matches!(
            (self, next),
            (Discovered, Processed)
                | (Processed, Publishable)
                | (Processed, NeedsReview)
                | (Processed, Rejected)
                | (Publishable, Published)
                | (NeedsReview, Publishable)
                | (NeedsReview, Rejected)
                | (Published, Closed)
                | (Published, Archived)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandidateState::Discovered => "discovered",
            CandidateState::Processed => "processed",
            CandidateState::Publishable => "publishable",
            CandidateState::Published => "published",
            CandidateState::Rejected => "rejected",
            CandidateState::Closed => "closed",
            CandidateState::Archived => "archived",
            CandidateState::NeedsReview => "needs_review",
        }
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named entities pulled out by extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Entities {
    pub organizations: Vec<String>,
    pub locations: Vec<String>,
    pub persons: Vec<String>,
}

impl Entities {
    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty() && self.locations.is_empty() && self.persons.is_empty()
    }

    fn union(&mut self, other: &Entities) {
        for (mine, theirs) in [
            (&mut self.organizations, &other.organizations),
            (&mut self.locations, &other.locations),
            (&mut self.persons, &other.persons),
        ] {
            for item in theirs {
                if !mine.contains(item) {
                    mine.push(item.clone());
                }
            }
        }
    }
}

/// Structured fields produced by the extraction adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractedFields {
    pub title: Option<String>,
    pub organization: Option<String>,
    pub summary: Option<String>,
    pub key_phrases: Vec<String>,
    pub application_url: Option<String>,
    pub contact_email: Option<String>,
    pub location: Option<String>,
    pub entities: Entities,
}

impl ExtractedFields {
    /// Fill every empty field from `other`; lists are unioned.
    pub fn fill_missing_from(&mut self, other: &ExtractedFields) {
        fn fill(slot: &mut Option<String>, from: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        fill(&mut self.title, &other.title);
        fill(&mut self.organization, &other.organization);
        fill(&mut self.summary, &other.summary);
        fill(&mut self.application_url, &other.application_url);
        fill(&mut self.contact_email, &other.contact_email);
        fill(&mut self.location, &other.location);
        for phrase in &other.key_phrases {
            if !self.key_phrases.contains(phrase) {
                self.key_phrases.push(phrase.clone());
            }
        }
        self.entities.union(&other.entities);
    }
}

/// URLs and hashes gathered from every linked discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub urls: BTreeSet<String>,
    pub content_hashes: BTreeSet<String>,
}

impl Evidence {
    pub fn union(&mut self, other: &Evidence) {
        self.urls.extend(other.urls.iter().cloned());
        self.content_hashes
            .extend(other.content_hashes.iter().cloned());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingCandidate {
    pub id: CandidateId,
    pub state: CandidateState,
    pub source_key: String,
    pub dedupe_bucket_key: String,
    pub dedupe_confidence: Option<f64>,
    /// Preferred public URL (first discovery, or a resolved redirect).
    pub canonical_url: String,
    pub evidence: Evidence,
    pub extracted_fields: ExtractedFields,
    pub risk_flags: Vec<String>,
    pub posting_id: Option<PostingId>,
    pub merged_into: Option<CandidateId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostingCandidate {
    pub fn new(
        id: CandidateId,
        source_key: impl Into<String>,
        canonical_url: impl Into<String>,
        bucket_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            state: CandidateState::Discovered,
            source_key: source_key.into(),
            dedupe_bucket_key: bucket_key.into(),
            dedupe_confidence: None,
            canonical_url: canonical_url.into(),
            evidence: Evidence::default(),
            extracted_fields: ExtractedFields::default(),
            risk_flags: Vec::new(),
            posting_id: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owns_posting(&self) -> bool {
        self.posting_id.is_some()
    }

    pub fn add_risk_flags<'a>(&mut self, flags: impl IntoIterator<Item = &'a String>) {
        for flag in flags {
            if !self.risk_flags.contains(flag) {
                self.risk_flags.push(flag.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use CandidateState::*;

    #[rstest]
    #[case(Discovered, Processed, true)]
    #[case(Discovered, Publishable, false)]
    #[case(Discovered, Published, false)]
    #[case(Processed, NeedsReview, true)]
    #[case(NeedsReview, Publishable, true)]
    #[case(NeedsReview, Published, false)]
    #[case(Publishable, Published, true)]
    #[case(Published, Archived, true)]
    #[case(Rejected, Processed, false)]
    #[case(Rejected, Publishable, false)]
    #[case(Archived, Published, false)]
    fn transition_table(#[case] from: CandidateState, #[case] to: CandidateState, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let all = [
            Discovered, Processed, Publishable, Published, Rejected, Closed, Archived, NeedsReview,
        ];
        for from in [Rejected, Closed, Archived] {
            assert!(from.is_terminal());
            assert!(all.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn fill_missing_keeps_existing_values() {
        let mut a = ExtractedFields {
            title: Some("Volunteer Driver".into()),
            key_phrases: vec!["driving".into()],
            ..Default::default()
        };
        let b = ExtractedFields {
            title: Some("Driver".into()),
            organization: Some("Food Shelf".into()),
            key_phrases: vec!["driving".into(), "weekends".into()],
            ..Default::default()
        };
        a.fill_missing_from(&b);
        assert_eq!(a.title.as_deref(), Some("Volunteer Driver"));
        assert_eq!(a.organization.as_deref(), Some("Food Shelf"));
        assert_eq!(a.key_phrases, vec!["driving", "weekends"]);
    }

    #[test]
    fn extracted_fields_reject_unknown_keys() {
        let err = serde_json::from_str::<ExtractedFields>(r#"{"title":"x","salary":"1"}"#);
        assert!(err.is_err());
    }
}
