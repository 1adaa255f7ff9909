//! Status - queue の状況を 1 行で説明する view

use std::fmt;

use serde::Serialize;

use crate::domain::{JobCounts, JobKind, Result};
use crate::pipeline::Pipeline;
use crate::typed::ExecutorRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub counts: JobCounts,
    pub executor_kinds: Vec<JobKind>,
}

impl StatusReport {
    pub fn collect(pipeline: &Pipeline, registry: &ExecutorRegistry) -> Result<Self> {
        Ok(Self {
            counts: pipeline.queue_counts()?,
            executor_kinds: registry.registered_kinds(),
        })
    }

    /// Jobs nobody will pick up again without a human.
    pub fn needs_attention(&self) -> bool {
        self.counts.dead_letter > 0
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        write!(
            f,
            "queued={} claimed={} done={} failed={} dead_letter={}",
            c.queued, c.claimed, c.done, c.failed, c.dead_letter
        )?;
        let kinds: Vec<&str> = self.executor_kinds.iter().map(|k| k.as_str()).collect();
        write!(f, " executors=[{}]", kinds.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_counts_and_executors() {
        let report = StatusReport {
            counts: JobCounts {
                queued: 2,
                dead_letter: 1,
                ..JobCounts::default()
            },
            executor_kinds: vec![JobKind::Extract, JobKind::CheckFreshness],
        };
        assert_eq!(
            report.to_string(),
            "queued=2 claimed=0 done=0 failed=0 dead_letter=1 executors=[extract,check_freshness]"
        );
        assert!(report.needs_attention());
    }
}
