//! Dedupe Scorer - 2 つの候補の merge confidence を計算する純粋関数
//!
//! シグナルは 3 段階で評価し、strong が見つかった時点で打ち切ります。
//! 1. Strong: content hash / 正規化 URL / application URL の一致
//! 2. Medium: title・organization・key phrases のテキスト類似度（加重平均）
//! 3. Tie-break: medium の値が判定境界の近くにあるときだけ、
//!    named entity の重なりと連絡先メールのドメイン一致で補正
//!
//! 乱数も時刻も使わないので、同じ入力には常に同じ結果を返し、
//! `score(a, b) == score(b, a)` が成り立ちます。

pub mod normalize;

use std::collections::BTreeSet;

use serde::Serialize;
use strsim::jaro_winkler;

use crate::config::DedupeConfig;
use crate::domain::{Entities, PostingCandidate};

pub use normalize::{
    bucket_key, canonical_url, email_domain, normalize_text, normalize_url, tokens,
};

const CONTENT_HASH_CONFIDENCE: f64 = 1.0;
const URL_CONFIDENCE: f64 = 0.98;
const APPLICATION_URL_CONFIDENCE: f64 = 0.96;

/// Gap kept between the best medium score and the strong tier.
const MEDIUM_CEILING_GAP: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTier {
    Strong,
    Medium,
    None,
}

/// One matched signal and its contribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub name: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub confidence: f64,
    pub tier: SignalTier,
    pub signals: Vec<Signal>,
    pub tie_break_applied: bool,
}

impl ScoreBreakdown {
    fn none() -> Self {
        Self {
            confidence: 0.0,
            tier: SignalTier::None,
            signals: Vec::new(),
            tie_break_applied: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupeScorer {
    config: DedupeConfig,
}

impl DedupeScorer {
    pub fn new(config: DedupeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    pub fn score(&self, a: &PostingCandidate, b: &PostingCandidate) -> ScoreBreakdown {
        if let Some(strong) = self.strong_signal(a, b) {
            return ScoreBreakdown {
                confidence: strong.value,
                tier: SignalTier::Strong,
                signals: vec![strong],
                tie_break_applied: false,
            };
        }
        self.medium_score(a, b)
    }

    /// Highest-scoring peer; ties go to the older candidate.
    pub fn best_match<'a>(
        &self,
        candidate: &PostingCandidate,
        peers: &'a [PostingCandidate],
    ) -> Option<(&'a PostingCandidate, ScoreBreakdown)> {
        let mut best: Option<(&'a PostingCandidate, ScoreBreakdown)> = None;
        for peer in peers.iter().filter(|p| p.id != candidate.id) {
            let breakdown = self.score(candidate, peer);
            if breakdown.confidence <= 0.0 {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, scored)) => {
                    breakdown.confidence > scored.confidence
                        || (breakdown.confidence == scored.confidence && peer.id < current.id)
                }
            };
            if better {
                best = Some((peer, breakdown));
            }
        }
        best
    }

    fn strong_signal(&self, a: &PostingCandidate, b: &PostingCandidate) -> Option<Signal> {
        let floor = self.config.strong_threshold;

        if a
            .evidence
            .content_hashes
            .intersection(&b.evidence.content_hashes)
            .next()
            .is_some()
        {
            return Some(Signal {
                name: "content_hash",
                value: CONTENT_HASH_CONFIDENCE.max(floor),
            });
        }

        if !url_set(a).is_disjoint(&url_set(b)) {
            return Some(Signal {
                name: "url",
                value: URL_CONFIDENCE.max(floor),
            });
        }

        let app_a = a.extracted_fields.application_url.as_deref().and_then(normalize_url);
        let app_b = b.extracted_fields.application_url.as_deref().and_then(normalize_url);
        if let (Some(x), Some(y)) = (app_a, app_b)
            && x == y
        {
            return Some(Signal {
                name: "application_url",
                value: APPLICATION_URL_CONFIDENCE.max(floor),
            });
        }
        None
    }

    fn medium_score(&self, a: &PostingCandidate, b: &PostingCandidate) -> ScoreBreakdown {
        let fa = &a.extracted_fields;
        let fb = &b.extracted_fields;
        let mut signals = Vec::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        let pairs = [
            ("title", self.config.title_weight, &fa.title, &fb.title),
            (
                "organization",
                self.config.organization_weight,
                &fa.organization,
                &fb.organization,
            ),
        ];
        for (name, weight, x, y) in pairs {
            if let (Some(x), Some(y)) = (x.as_deref(), y.as_deref()) {
                let sim = text_similarity(x, y);
                if let Some(sim) = sim {
                    signals.push(Signal { name, value: sim });
                    weighted += weight * sim;
                    total_weight += weight;
                }
            }
        }

        if !fa.key_phrases.is_empty() && !fb.key_phrases.is_empty() {
            let pa: BTreeSet<String> = fa.key_phrases.iter().map(|p| normalize_text(p)).collect();
            let pb: BTreeSet<String> = fb.key_phrases.iter().map(|p| normalize_text(p)).collect();
            let sim = jaccard(&pa, &pb);
            signals.push(Signal {
                name: "key_phrases",
                value: sim,
            });
            weighted += self.config.phrases_weight * sim;
            total_weight += self.config.phrases_weight;
        }

        if total_weight <= 0.0 {
            return ScoreBreakdown::none();
        }

        let ceiling = (self.config.strong_threshold - MEDIUM_CEILING_GAP).max(0.0);
        let mut confidence = (weighted / total_weight).clamp(0.0, ceiling);
        let mut tie_break_applied = false;

        if self.is_ambiguous(confidence) {
            tie_break_applied = true;
            if entities_overlap(&fa.entities, &fb.entities) {
                signals.push(Signal {
                    name: "entity_overlap",
                    value: self.config.entity_bonus,
                });
                confidence += self.config.entity_bonus;
            }
            let da = fa.contact_email.as_deref().and_then(email_domain);
            let db = fb.contact_email.as_deref().and_then(email_domain);
            if let (Some(x), Some(y)) = (da, db)
                && x == y
            {
                signals.push(Signal {
                    name: "email_domain",
                    value: self.config.email_domain_bonus,
                });
                confidence += self.config.email_domain_bonus;
            }
            confidence = confidence.clamp(0.0, ceiling);
        }

        ScoreBreakdown {
            confidence,
            tier: if confidence > 0.0 {
                SignalTier::Medium
            } else {
                SignalTier::None
            },
            signals,
            tie_break_applied,
        }
    }

    fn is_ambiguous(&self, confidence: f64) -> bool {
        let band = self.config.tie_break_band;
        (confidence - self.config.uncertain_band_low).abs() <= band
            || (confidence - self.config.uncertain_band_high).abs() <= band
    }
}

fn url_set(c: &PostingCandidate) -> BTreeSet<String> {
    std::iter::once(c.canonical_url.as_str())
        .chain(c.evidence.urls.iter().map(String::as_str))
        .filter_map(normalize_url)
        .collect()
}

/// Symmetric blend of Jaro-Winkler and token-set overlap. `None` when
/// either side normalises to nothing.
fn text_similarity(a: &str, b: &str) -> Option<f64> {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    if na.is_empty() || nb.is_empty() {
        return None;
    }
    let jw = (jaro_winkler(&na, &nb) + jaro_winkler(&nb, &na)) / 2.0;
    let ts = jaccard(&tokens(&na), &tokens(&nb));
    Some((jw + ts) / 2.0)
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn entities_overlap(a: &Entities, b: &Entities) -> bool {
    let flatten = |e: &Entities| -> BTreeSet<String> {
        e.organizations
            .iter()
            .chain(&e.locations)
            .chain(&e.persons)
            .map(|s| normalize_text(s))
            .filter(|s| !s.is_empty())
            .collect()
    };
    !flatten(a).is_disjoint(&flatten(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateId, ExtractedFields};
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn candidate(url: &str, fields: ExtractedFields) -> PostingCandidate {
        let mut c = PostingCandidate::new(
            CandidateId::from_ulid(Ulid::new()),
            "rss:test",
            url,
            bucket_key(url),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        );
        c.evidence.urls.insert(url.to_string());
        c.extracted_fields = fields;
        c
    }

    fn fields(title: &str, org: &str) -> ExtractedFields {
        ExtractedFields {
            title: Some(title.into()),
            organization: Some(org.into()),
            ..Default::default()
        }
    }

    #[test]
    fn identical_content_hash_is_strong() {
        let mut a = candidate("https://a.org/1", fields("Tutor", "Library"));
        let mut b = candidate("https://a.org/2", fields("Driver", "Food Shelf"));
        a.evidence.content_hashes.insert("h".into());
        b.evidence.content_hashes.insert("h".into());
        let s = DedupeScorer::default().score(&a, &b);
        assert_eq!(s.tier, SignalTier::Strong);
        assert_eq!(s.confidence, 1.0);
        assert_eq!(s.signals[0].name, "content_hash");
    }

    #[test]
    fn normalised_url_equality_is_strong() {
        let a = candidate("https://www.a.org/jobs/1/", ExtractedFields::default());
        let b = candidate("https://a.org/jobs/1?utm_source=feed", ExtractedFields::default());
        let s = DedupeScorer::default().score(&a, &b);
        assert_eq!(s.tier, SignalTier::Strong);
        assert!(s.confidence >= 0.95);
    }

    #[test]
    fn application_url_equality_is_strong() {
        let mut fa = fields("Tutor", "Library");
        fa.application_url = Some("https://apply.org/form".into());
        let mut fb = fields("Reading Buddy", "City Library");
        fb.application_url = Some("https://apply.org/form/".into());
        let s = DedupeScorer::default().score(
            &candidate("https://a.org/1", fa),
            &candidate("https://a.org/2", fb),
        );
        assert_eq!(s.signals[0].name, "application_url");
        assert!(s.confidence >= 0.95);
    }

    #[test]
    fn identical_text_stays_below_strong_tier() {
        let a = candidate("https://a.org/1", fields("Volunteer Driver", "Food Shelf"));
        let b = candidate("https://a.org/2", fields("Volunteer Driver", "Food Shelf"));
        let s = DedupeScorer::default().score(&a, &b);
        assert_eq!(s.tier, SignalTier::Medium);
        assert!(s.confidence < 0.95);
        assert!(s.confidence > 0.9);
    }

    #[test]
    fn unrelated_text_scores_low() {
        let a = candidate("https://a.org/1", fields("Volunteer Driver", "Food Shelf"));
        let b = candidate("https://a.org/2", fields("Chess Coach", "Youth Club"));
        let s = DedupeScorer::default().score(&a, &b);
        assert!(s.confidence < 0.7, "got {}", s.confidence);
    }

    #[test]
    fn score_is_deterministic_and_symmetric() {
        let mut fa = fields("Weekend Meal Delivery Driver", "Northside Food Shelf");
        fa.key_phrases = vec!["driving".into(), "meals".into()];
        fa.contact_email = Some("vol@northside.org".into());
        let mut fb = fields("Meal Delivery Volunteer", "Northside Foodshelf");
        fb.key_phrases = vec!["meals".into(), "weekends".into()];
        fb.contact_email = Some("info@northside.org".into());
        let a = candidate("https://a.org/1", fa);
        let b = candidate("https://a.org/2", fb);

        let scorer = DedupeScorer::default();
        let ab = scorer.score(&a, &b);
        assert_eq!(ab, scorer.score(&a, &b));
        assert_eq!(ab.confidence, scorer.score(&b, &a).confidence);
    }

    #[test]
    fn tie_break_only_applies_near_a_boundary() {
        let config = DedupeConfig {
            uncertain_band_low: 0.5,
            uncertain_band_high: 0.9,
            tie_break_band: 0.0,
            ..DedupeConfig::default()
        };
        let mut fa = fields("Volunteer Driver", "Food Shelf");
        fa.entities.organizations = vec!["Food Shelf".into()];
        let mut fb = fields("Volunteer Driver", "Food Shelf");
        fb.entities.organizations = vec!["Food Shelf".into()];
        let a = candidate("https://a.org/1", fa);
        let b = candidate("https://a.org/2", fb);

        let s = DedupeScorer::new(config).score(&a, &b);
        assert!(!s.tie_break_applied);
        assert!(s.signals.iter().all(|sig| sig.name != "entity_overlap"));
    }

    #[test]
    fn tie_break_signals_apply_near_a_boundary() {
        let mut fa = fields("Volunteer Driver", "Food Shelf");
        fa.entities.locations = vec!["Minneapolis".into()];
        fa.contact_email = Some("a@foodshelf.org".into());
        let mut fb = fields("Volunteer Driver", "Food Shelf");
        fb.entities.locations = vec!["minneapolis".into()];
        fb.contact_email = Some("b@FoodShelf.org".into());
        let a = candidate("https://a.org/1", fa);
        let b = candidate("https://a.org/2", fb);

        // Identical text sits at the medium ceiling (0.989), right on the upper band edge.
        let config = DedupeConfig {
            uncertain_band_high: 0.99,
            tie_break_band: 0.01,
            strong_threshold: 0.99,
            ..DedupeConfig::default()
        };
        let lifted = DedupeScorer::new(config).score(&a, &b);
        assert!(lifted.tie_break_applied);
        assert!(lifted.signals.iter().any(|s| s.name == "entity_overlap"));
        assert!(lifted.signals.iter().any(|s| s.name == "email_domain"));
    }

    #[test]
    fn best_match_prefers_higher_then_older() {
        let scorer = DedupeScorer::default();
        let me = candidate("https://a.org/x", fields("Volunteer Driver", "Food Shelf"));
        let weak = candidate("https://a.org/y", fields("Chess Coach", "Youth Club"));
        let mut strong = candidate("https://a.org/z", fields("Other", "Other"));
        strong.evidence.urls.insert("https://a.org/x".into());
        let peers = vec![weak.clone(), strong.clone(), me.clone()];

        let (found, breakdown) = scorer.best_match(&me, &peers).unwrap();
        assert_eq!(found.id, strong.id);
        assert_eq!(breakdown.tier, SignalTier::Strong);
    }
}
