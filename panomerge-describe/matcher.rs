use panomerge_core::{Correspondence, DescriptorSet, FeatureSet, MergeError, MergeResult};
use rayon::prelude::*;
use tracing::debug;

use crate::brief::hamming_distance;
use crate::gradient::squared_distance;

/// Two nearest neighbours of one query descriptor: (index, distance) pairs
type Neighbours<D> = (Option<(usize, D)>, Option<(usize, D)>);

/// Nearest-neighbour matching filtered by the ratio test.
///
/// For each keypoint of `a`, the two closest descriptors of `b` are found by
/// the metric of the descriptor kind. The pair is accepted when
/// `best < threshold * second_best`; a query with fewer than two candidates in `b`
/// is never accepted. Each keypoint of `a` yields at most one correspondence.
pub fn match_features(a: &FeatureSet, b: &FeatureSet, threshold: f32) -> MergeResult<Vec<Correspondence>> {
    if !(threshold.is_finite() && threshold > 0.0 && threshold < 1.0) {
        return Err(MergeError::Configuration(format!(
            "match threshold {} must lie in (0, 1)",
            threshold
        )));
    }

    let matches = match (&a.descriptors, &b.descriptors) {
        (DescriptorSet::Float(qa), DescriptorSet::Float(tb)) => {
            // Compare squared distances against the squared ratio
            let ratio_sq = threshold * threshold;
            qa.par_iter()
                .enumerate()
                .filter_map(|(qi, q)| {
                    let (best, second) = two_nearest(tb.iter().map(|t| squared_distance(q, t)));
                    match (best, second) {
                        (Some((ti, d1)), Some((_, d2))) if d1 < ratio_sq * d2 => Some(Correspondence {
                            query_idx: qi,
                            train_idx: ti,
                            distance: d1.sqrt(),
                        }),
                        _ => None,
                    }
                })
                .collect::<Vec<_>>()
        }
        (DescriptorSet::Binary(qa), DescriptorSet::Binary(tb)) => qa
            .par_iter()
            .enumerate()
            .filter_map(|(qi, q)| {
                let (best, second) = two_nearest(tb.iter().map(|t| hamming_distance(q, t)));
                match (best, second) {
                    (Some((ti, d1)), Some((_, d2))) if (d1 as f32) < threshold * d2 as f32 => Some(Correspondence {
                        query_idx: qi,
                        train_idx: ti,
                        distance: d1 as f32,
                    }),
                    _ => None,
                }
            })
            .collect::<Vec<_>>(),
        _ => {
            return Err(MergeError::Configuration(format!(
                "cannot match {} descriptors against {} descriptors",
                a.kind(),
                b.kind()
            )));
        }
    };

    debug!(
        query = a.len(),
        train = b.len(),
        threshold,
        accepted = matches.len(),
        "ratio-test matching"
    );
    Ok(matches)
}

/// Smallest and second-smallest distances; ties keep the lower index first
fn two_nearest<D: PartialOrd + Copy>(distances: impl Iterator<Item = D>) -> Neighbours<D> {
    let mut best: Option<(usize, D)> = None;
    let mut second: Option<(usize, D)> = None;
    for (i, d) in distances.enumerate() {
        match best {
            Some((_, bd)) if d >= bd => {
                if second.is_none_or(|(_, sd)| d < sd) {
                    second = Some((i, d));
                }
            }
            _ => {
                second = best;
                best = Some((i, d));
            }
        }
    }
    (best, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use panomerge_core::{BinaryDescriptor, DetectorKind, FloatDescriptor, Keypoint};
    use proptest::prelude::*;

    fn float_set(descs: Vec<FloatDescriptor>) -> FeatureSet {
        FeatureSet {
            keypoints: (0..descs.len()).map(|i| Keypoint::at(i as f32, 0.0)).collect(),
            descriptors: DescriptorSet::Float(descs),
        }
    }

    fn binary_set(descs: Vec<BinaryDescriptor>) -> FeatureSet {
        FeatureSet {
            keypoints: (0..descs.len()).map(|i| Keypoint::at(i as f32, 0.0)).collect(),
            descriptors: DescriptorSet::Binary(descs),
        }
    }

    fn unit(axis: usize, scale: f32) -> FloatDescriptor {
        let mut d = [0.0f32; 128];
        d[axis] = scale;
        d
    }

    #[test]
    fn test_two_nearest() {
        let (best, second) = two_nearest([5u32, 2, 9, 2, 1].into_iter());
        assert_eq!(best, Some((4, 1)));
        assert_eq!(second, Some((1, 2)));
        let (best, second) = two_nearest([3u32].into_iter());
        assert_eq!(best, Some((0, 3)));
        assert_eq!(second, None);
    }

    #[test]
    fn test_distinct_match_accepted_ambiguous_rejected() {
        let a = float_set(vec![unit(0, 1.0), unit(1, 1.0)]);
        // Query 0 has one clear partner; query 1 has two equally close partners
        let mut near_1a = unit(1, 1.0);
        near_1a[2] = 0.1;
        let mut near_1b = unit(1, 1.0);
        near_1b[3] = 0.1;
        let b = float_set(vec![unit(0, 1.0), near_1a, near_1b]);

        let matches = match_features(&a, &b, 0.7).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].query_idx, matches[0].train_idx), (0, 0));
        assert_eq!(matches[0].distance, 0.0);
    }

    #[test]
    fn test_single_candidate_never_matches() {
        let a = binary_set(vec![[0u8; 32]]);
        let b = binary_set(vec![[0u8; 32]]);
        assert!(match_features(&a, &b, 0.9).unwrap().is_empty());
        assert!(match_features(&a, &FeatureSet::empty(DetectorKind::Binary), 0.9).unwrap().is_empty());
    }

    #[test]
    fn test_hamming_ratio() {
        let a = binary_set(vec![[0u8; 32]]);
        let mut close = [0u8; 32];
        close[0] = 0b1;
        let far = [0xffu8; 32];
        let b = binary_set(vec![far, close]);
        let matches = match_features(&a, &b, 0.5).unwrap();
        assert_eq!(matches, vec![Correspondence { query_idx: 0, train_idx: 1, distance: 1.0 }]);
    }

    #[test]
    fn test_kind_mismatch_and_bad_threshold() {
        let a = binary_set(vec![[0u8; 32]]);
        let b = float_set(vec![unit(0, 1.0)]);
        assert!(matches!(match_features(&a, &b, 0.7), Err(MergeError::Configuration(_))));
        assert!(matches!(match_features(&a, &a, 1.0), Err(MergeError::Configuration(_))));
        assert!(matches!(match_features(&a, &a, 0.0), Err(MergeError::Configuration(_))));
    }

    fn arb_binary_set(max: usize) -> impl Strategy<Value = FeatureSet> {
        prop::collection::vec(prop::array::uniform32(any::<u8>()), 0..max).prop_map(binary_set)
    }

    proptest! {
        #[test]
        fn prop_stricter_threshold_never_adds_matches(
            a in arb_binary_set(24),
            b in arb_binary_set(24),
            t1 in 0.05f32..0.95,
            t2 in 0.05f32..0.95,
        ) {
            let (strict, loose) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
            let m_strict = match_features(&a, &b, strict).unwrap();
            let m_loose = match_features(&a, &b, loose).unwrap();
            prop_assert!(m_strict.len() <= m_loose.len());
            // Strict matches are a subset of loose ones
            for m in &m_strict {
                prop_assert!(m_loose.iter().any(|l| l.query_idx == m.query_idx && l.train_idx == m.train_idx));
            }
        }

        #[test]
        fn prop_each_query_matched_at_most_once(a in arb_binary_set(20), b in arb_binary_set(20), t in 0.1f32..0.95) {
            let matches = match_features(&a, &b, t).unwrap();
            let mut seen: Vec<usize> = matches.iter().map(|m| m.query_idx).collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), matches.len());
        }
    }
}
