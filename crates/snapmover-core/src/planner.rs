use crate::classify::{Classification, Classified};
use crate::probe::DiskUsage;
use crate::scanner::CacheFile;
use std::cmp::Ordering;
use tracing::{debug, info};

/// A cache file together with the group it is evicted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationCandidate {
    pub file: CacheFile,
    pub classification: Classification,
}

impl MigrationCandidate {
    pub fn size_bytes(&self) -> u64 {
        self.file.size_bytes
    }

    pub fn is_pinned(&self) -> bool {
        self.classification == Classification::Pinned
    }
}

/// Unpinned before pinned; oldest access first within a group; path breaks ties.
fn eviction_order(a: &MigrationCandidate, b: &MigrationCandidate) -> Ordering {
    a.is_pinned()
        .cmp(&b.is_pinned())
        .then(a.file.last_access.cmp(&b.file.last_access))
        .then_with(|| a.file.relative_path.cmp(&b.file.relative_path))
}

/// Flatten a classification into eviction order.
pub fn order_candidates(classified: Classified) -> Vec<MigrationCandidate> {
    let unpinned = classified.unpinned.into_iter().map(|file| MigrationCandidate {
        file,
        classification: Classification::Unpinned,
    });
    let pinned = classified.pinned.into_iter().map(|file| MigrationCandidate {
        file,
        classification: Classification::Pinned,
    });

    let mut candidates: Vec<MigrationCandidate> = unpinned.chain(pinned).collect();
    candidates.sort_by(eviction_order);
    candidates
}

/// Length of the shortest prefix of `candidates` whose sizes add up to at
/// least `needed_bytes`, or all of them when even that is not enough.
pub fn select_prefix(candidates: &[MigrationCandidate], needed_bytes: u64) -> usize {
    if needed_bytes == 0 {
        return 0;
    }
    let mut cumulative = 0u64;
    for (i, candidate) in candidates.iter().enumerate() {
        cumulative = cumulative.saturating_add(candidate.size_bytes());
        if cumulative >= needed_bytes {
            return i + 1;
        }
    }
    candidates.len()
}

/// Outcome of planning: every candidate in eviction order, of which the first
/// `selected_len` are projected to bring usage down to the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    pub usage: DiskUsage,
    pub threshold: f64,
    pub needed_bytes: u64,
    pub candidates: Vec<MigrationCandidate>,
    pub selected_len: usize,
}

impl PlanResult {
    /// A plan that moves nothing.
    pub fn empty(usage: DiskUsage, threshold: f64) -> Self {
        Self {
            usage,
            threshold,
            needed_bytes: usage.needed_reclaim_bytes(threshold),
            candidates: Vec::new(),
            selected_len: 0,
        }
    }

    pub fn selected(&self) -> &[MigrationCandidate] {
        &self.candidates[..self.selected_len]
    }

    /// Candidates past the selection, used when selected moves fail.
    pub fn reserve(&self) -> &[MigrationCandidate] {
        &self.candidates[self.selected_len..]
    }

    pub fn is_empty(&self) -> bool {
        self.selected_len == 0
    }

    pub fn projected_reclaim_bytes(&self) -> u64 {
        self.selected().iter().map(|c| c.size_bytes()).sum()
    }

    pub fn projected_usage(&self) -> f64 {
        self.usage
            .after_reclaim(self.projected_reclaim_bytes())
            .used_fraction()
    }

    /// False when even moving every candidate is not projected to reach the threshold.
    pub fn satisfiable(&self) -> bool {
        self.projected_reclaim_bytes() >= self.needed_bytes
    }

    pub fn unpinned_count(&self) -> usize {
        self.candidates.iter().filter(|c| !c.is_pinned()).count()
    }

    pub fn pinned_count(&self) -> usize {
        self.candidates.len() - self.unpinned_count()
    }

    pub fn selected_pinned_count(&self) -> usize {
        self.selected().iter().filter(|c| c.is_pinned()).count()
    }
}

/// Order the classified files and greedily select enough of them to cover the
/// reclaim needed to bring `usage` to `threshold`.
pub fn plan(usage: DiskUsage, threshold: f64, classified: Classified) -> PlanResult {
    select(usage, threshold, order_candidates(classified))
}

/// Greedy selection over candidates that are already in eviction order.
pub fn select(usage: DiskUsage, threshold: f64, candidates: Vec<MigrationCandidate>) -> PlanResult {
    let needed_bytes = usage.needed_reclaim_bytes(threshold);
    if needed_bytes == 0 {
        debug!("Usage {:.3} already within threshold {:.3}", usage.used_fraction(), threshold);
        return PlanResult::empty(usage, threshold);
    }

    let selected_len = select_prefix(&candidates, needed_bytes);
    let result = PlanResult {
        usage,
        threshold,
        needed_bytes,
        candidates,
        selected_len,
    };

    info!(
        "Selected {} of {} candidates ({} pinned) to reclaim {} of {} needed bytes",
        result.selected_len,
        result.candidates.len(),
        result.selected_pinned_count(),
        result.projected_reclaim_bytes(),
        needed_bytes
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Fingerprint;
    use std::path::PathBuf;

    fn file(path: &str, size: u64, atime: i64) -> CacheFile {
        CacheFile {
            relative_path: PathBuf::from(path),
            size_bytes: size,
            last_access: atime,
            fingerprint: Fingerprint {
                size,
                modified_secs: atime,
                modified_nanos: 0,
            },
        }
    }

    fn usage(total: u64, used: u64) -> DiskUsage {
        DiskUsage {
            total_bytes: total,
            used_bytes: used,
            free_bytes: total - used,
        }
    }

    #[test]
    fn test_within_threshold_plans_nothing() {
        let classified = Classified {
            unpinned: vec![file("a", 100, 1)],
            pinned: vec![],
        };
        let result = plan(usage(1000, 500), 0.5, classified);
        assert!(result.is_empty());
        assert_eq!(result.needed_bytes, 0);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_single_exact_unpinned_file() {
        let classified = Classified {
            unpinned: vec![file("movie.mkv", 300, 10)],
            pinned: vec![],
        };
        let result = plan(usage(1000, 800), 0.5, classified);
        assert_eq!(result.selected().len(), 1);
        assert_eq!(result.projected_reclaim_bytes(), 300);
        assert!((result.projected_usage() - 0.5).abs() < 1e-12);
        assert!(result.satisfiable());
    }

    #[test]
    fn test_all_pinned_still_selects_oldest_first() {
        let classified = Classified {
            unpinned: vec![],
            pinned: vec![file("new", 200, 30), file("old", 200, 10), file("mid", 200, 20)],
        };
        let result = plan(usage(1000, 800), 0.5, classified);
        let names: Vec<_> = result
            .selected()
            .iter()
            .map(|c| c.file.relative_path.to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["old", "mid"]);
        assert!(result.projected_reclaim_bytes() >= result.needed_bytes);
    }

    #[test]
    fn test_unpinned_used_before_pinned() {
        let classified = Classified {
            unpinned: vec![file("fresh", 100, 99)],
            pinned: vec![file("ancient", 500, 1)],
        };
        let ordered = order_candidates(classified);
        assert_eq!(ordered[0].file.relative_path, PathBuf::from("fresh"));
        assert!(ordered[1].is_pinned());
    }

    #[test]
    fn test_overshoot_bounded_by_last_file() {
        let classified = Classified {
            unpinned: vec![file("a", 100, 1), file("b", 150, 2), file("c", 400, 3)],
            pinned: vec![],
        };
        let result = plan(usage(1000, 800), 0.5, classified);
        let selected = result.selected();
        assert_eq!(selected.len(), 3);
        let without_last: u64 = selected[..selected.len() - 1]
            .iter()
            .map(|c| c.size_bytes())
            .sum();
        assert!(without_last < result.needed_bytes);
        assert_eq!(result.reserve().len(), 0);
    }

    #[test]
    fn test_insufficient_candidates_select_everything() {
        let classified = Classified {
            unpinned: vec![file("a", 10, 1)],
            pinned: vec![file("b", 10, 1)],
        };
        let result = plan(usage(1000, 800), 0.5, classified);
        assert_eq!(result.selected_len, 2);
        assert!(!result.satisfiable());
    }

    #[test]
    fn test_ties_broken_by_path() {
        let classified = Classified {
            unpinned: vec![file("b", 1, 5), file("a", 1, 5)],
            pinned: vec![],
        };
        let ordered = order_candidates(classified);
        assert_eq!(ordered[0].file.relative_path, PathBuf::from("a"));
    }

    #[test]
    fn test_select_prefix_zero_need() {
        let ordered = order_candidates(Classified {
            unpinned: vec![file("a", 1, 1)],
            pinned: vec![],
        });
        assert_eq!(select_prefix(&ordered, 0), 0);
    }
}
