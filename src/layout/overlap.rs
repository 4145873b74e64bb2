use tracing::debug;

use crate::error::{PipelineError, check_threshold};

use super::RawInstance;
use super::geom::ratio;

/// Instances that survived overlap resolution, in their original relative order.
#[derive(Debug, Clone, Default)]
pub struct CleanInstanceSet {
    instances: Vec<RawInstance>,
    source_indices: Vec<usize>,
}

impl CleanInstanceSet {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[RawInstance] {
        &self.instances
    }

    /// Position of each survivor in the sequence handed to [`resolve_overlaps`].
    pub fn source_indices(&self) -> &[usize] {
        &self.source_indices
    }

    pub fn into_instances(self) -> Vec<RawInstance> {
        self.instances
    }
}

/// Removes instances absorbed by another one.
///
/// `A` is absorbed by `B` when `|A ∩ B| / |A| >= containment_threshold`. When the
/// containment holds both ways the smaller instance goes, then the lower score,
/// then the later one. Removal repeats until no surviving pair is over the threshold.
pub fn resolve_overlaps(
    instances: Vec<RawInstance>,
    containment_threshold: f32,
) -> Result<CleanInstanceSet, PipelineError> {
    let threshold = check_threshold("containments_threshold", containment_threshold)?;
    let n = instances.len();
    let areas: Vec<u64> = instances.iter().map(|i| i.mask.area()).collect();

    // Intersections do not change as instances are removed, so compute them once.
    let mut shared = vec![0u64; n * n];
    for a in 0..n {
        for b in (a + 1)..n {
            let value = instances[a].mask.intersection_area(&instances[b].mask);
            shared[a * n + b] = value;
            shared[b * n + a] = value;
        }
    }

    let mut alive = vec![true; n];
    let mut removed = 0usize;
    while let Some(victim) = find_absorbed(&instances, &areas, &shared, &alive, threshold) {
        alive[victim] = false;
        removed += 1;
    }
    if removed > 0 {
        debug!("overlap resolution removed {} of {} instances", removed, n);
    }

    let mut clean = CleanInstanceSet::default();
    for (idx, instance) in instances.into_iter().enumerate() {
        if alive[idx] {
            clean.instances.push(instance);
            clean.source_indices.push(idx);
        }
    }
    Ok(clean)
}

fn find_absorbed(
    instances: &[RawInstance],
    areas: &[u64],
    shared: &[u64],
    alive: &[bool],
    threshold: f32,
) -> Option<usize> {
    let n = instances.len();
    for a in (0..n).filter(|&a| alive[a]) {
        for b in (0..n).filter(|&b| b != a && alive[b]) {
            let inter = shared[a * n + b];
            if ratio(inter, areas[a]) < threshold {
                continue;
            }
            if ratio(inter, areas[b]) >= threshold {
                return Some(weaker(instances, areas, a, b));
            }
            return Some(a);
        }
    }
    None
}

fn weaker(instances: &[RawInstance], areas: &[u64], a: usize, b: usize) -> usize {
    if areas[a] != areas[b] {
        return if areas[a] < areas[b] { a } else { b };
    }
    let (sa, sb) = (instances[a].score, instances[b].score);
    if sa != sb {
        return if sa < sb { a } else { b };
    }
    a.max(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::containment_ratio;
    use crate::test_util::scored_rect;

    fn scores(set: &CleanInstanceSet) -> Vec<f32> {
        set.instances().iter().map(|i| i.score).collect()
    }

    #[test]
    fn nested_instance_is_removed() {
        let instances = vec![
            scored_rect(100, 100, 10, 10, 10, 10, 0.9),
            scored_rect(100, 100, 0, 0, 50, 50, 0.6),
            scored_rect(100, 100, 60, 60, 20, 20, 0.7),
        ];
        let clean = resolve_overlaps(instances, 0.5).expect("resolve");
        assert_eq!(scores(&clean), vec![0.6, 0.7]);
        assert_eq!(clean.source_indices(), &[1, 2]);
    }

    #[test]
    fn near_duplicates_keep_the_larger() {
        let instances = vec![
            scored_rect(100, 100, 0, 0, 20, 20, 0.95),
            scored_rect(100, 100, 0, 0, 20, 21, 0.5),
        ];
        let clean = resolve_overlaps(instances, 0.8).expect("resolve");
        assert_eq!(scores(&clean), vec![0.5]);
    }

    #[test]
    fn equal_duplicates_keep_the_more_confident() {
        let instances = vec![
            scored_rect(100, 100, 5, 5, 20, 20, 0.4),
            scored_rect(100, 100, 5, 5, 20, 20, 0.8),
        ];
        let clean = resolve_overlaps(instances, 0.5).expect("resolve");
        assert_eq!(scores(&clean), vec![0.8]);
    }

    #[test]
    fn chains_resolve_transitively() {
        let instances = vec![
            scored_rect(200, 200, 20, 20, 10, 10, 0.9),
            scored_rect(200, 200, 10, 10, 40, 40, 0.8),
            scored_rect(200, 200, 0, 0, 100, 100, 0.7),
        ];
        let clean = resolve_overlaps(instances, 0.5).expect("resolve");
        assert_eq!(clean.len(), 1);
        assert_eq!(clean.source_indices(), &[2]);
    }

    #[test]
    fn survivors_satisfy_threshold_and_resolution_is_idempotent() {
        let instances = vec![
            scored_rect(120, 120, 0, 0, 40, 40, 0.9),
            scored_rect(120, 120, 30, 0, 40, 40, 0.8),
            scored_rect(120, 120, 35, 5, 30, 30, 0.7),
            scored_rect(120, 120, 0, 60, 120, 20, 0.6),
            scored_rect(120, 120, 10, 62, 20, 10, 0.5),
        ];
        let threshold = 0.6;
        let clean = resolve_overlaps(instances, threshold).expect("resolve");
        for (i, a) in clean.instances().iter().enumerate() {
            for (j, b) in clean.instances().iter().enumerate() {
                if i != j {
                    assert!(containment_ratio(&a.mask, &b.mask) < threshold);
                }
            }
        }
        let first = scores(&clean);
        let again = resolve_overlaps(clean.into_instances(), threshold).expect("resolve");
        assert_eq!(scores(&again), first);
    }

    #[test]
    fn empty_input_gives_empty_set() {
        let clean = resolve_overlaps(Vec::new(), 0.5).expect("resolve");
        assert!(clean.is_empty());
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        assert!(matches!(
            resolve_overlaps(Vec::new(), 1.01),
            Err(PipelineError::InvalidThreshold {
                name: "containments_threshold",
                ..
            })
        ));
    }
}
