use rayon::prelude::*;

use crate::features::Descriptor;

/// Nearest reference descriptor for one candidate descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    /// Index into the candidate's features.
    pub query: usize,
    /// Index into the reference's features.
    pub train: usize,
    pub distance: u32,
}

/// How many of the distance-sorted matches are handed to homography
/// estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchFilter {
    /// Keep the best `fraction` of all matches.
    TopFraction(f32),
    /// Keep matches whose Hamming distance is at most this.
    MaxDistance(u32),
}

impl Default for MatchFilter {
    fn default() -> Self {
        MatchFilter::TopFraction(0.7)
    }
}

pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Brute-force nearest neighbour of every query descriptor among `train`.
/// Equal distances resolve to the lowest train index.
pub fn match_descriptors(query: &[Descriptor], train: &[Descriptor]) -> Vec<DescriptorMatch> {
    if train.is_empty() {
        return vec![];
    }
    query
        .par_iter()
        .enumerate()
        .filter_map(|(query_idx, q)| {
            train
                .iter()
                .enumerate()
                .map(|(train_idx, t)| (hamming_distance(q, t), train_idx))
                .min()
                .map(|(distance, train_idx)| DescriptorMatch {
                    query: query_idx,
                    train: train_idx,
                    distance,
                })
        })
        .collect()
}

/// Orders matches best first (ties by query index) and keeps those the
/// filter admits.
pub fn filter_matches(
    mut matches: Vec<DescriptorMatch>,
    filter: MatchFilter,
) -> Vec<DescriptorMatch> {
    matches.sort_by_key(|m| (m.distance, m.query));
    match filter {
        MatchFilter::TopFraction(fraction) => {
            let fraction = if fraction.is_nan() {
                0.0
            } else {
                fraction.clamp(0.0, 1.0)
            };
            let keep = (matches.len() as f64 * fraction as f64).floor() as usize;
            matches.truncate(keep);
        }
        MatchFilter::MaxDistance(max) => matches.retain(|m| m.distance <= max),
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(fill: u8, flips: &[usize]) -> Descriptor {
        let mut d = [fill; 32];
        for &bit in flips {
            d[bit / 8] ^= 1 << (bit % 8);
        }
        d
    }

    fn m(query: usize, distance: u32) -> DescriptorMatch {
        DescriptorMatch {
            query,
            train: 0,
            distance,
        }
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming_distance(&[0; 32], &[0; 32]), 0);
        assert_eq!(hamming_distance(&[0; 32], &[0xff; 32]), 256);
        assert_eq!(hamming_distance(&descriptor(0, &[1, 9, 200]), &[0; 32]), 3);
    }

    #[test]
    fn matches_nearest_with_lowest_index_on_ties() {
        let train = vec![
            descriptor(0, &[0, 1, 2]),
            descriptor(0xff, &[]),
            descriptor(0, &[5]),
            descriptor(0, &[6]),
        ];
        let query = vec![descriptor(0, &[]), descriptor(0xff, &[3])];
        let matches = match_descriptors(&query, &train);
        assert_eq!(
            matches,
            vec![
                DescriptorMatch {
                    query: 0,
                    train: 2,
                    distance: 1
                },
                DescriptorMatch {
                    query: 1,
                    train: 1,
                    distance: 1
                },
            ]
        );
        assert!(match_descriptors(&query, &[]).is_empty());
    }

    #[test]
    fn top_fraction_keeps_best_matches() {
        let matches = vec![m(0, 40), m(1, 3), m(2, 17), m(3, 3), m(4, 90), m(5, 8)];
        let kept = filter_matches(matches, MatchFilter::TopFraction(0.7));
        let kept: Vec<(usize, u32)> = kept.iter().map(|m| (m.query, m.distance)).collect();
        // floor(6 * 0.7) = 4
        assert_eq!(kept, vec![(1, 3), (3, 3), (5, 8), (2, 17)]);
    }

    #[test]
    fn top_fraction_is_clamped() {
        let matches = vec![m(0, 4), m(1, 2)];
        assert_eq!(
            filter_matches(matches.clone(), MatchFilter::TopFraction(70.0)).len(),
            2
        );
        assert!(filter_matches(matches, MatchFilter::TopFraction(-1.0)).is_empty());
    }

    #[test]
    fn max_distance_keeps_close_matches() {
        let matches = vec![m(0, 40), m(1, 3), m(2, 17), m(3, 64)];
        let kept = filter_matches(matches, MatchFilter::MaxDistance(40));
        let queries: Vec<usize> = kept.iter().map(|m| m.query).collect();
        assert_eq!(queries, vec![1, 2, 0]);
    }
}
