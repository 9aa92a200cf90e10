//! Near-neighbor search around predicted features and one-to-one association.

use std::collections::HashSet;

use nalgebra::{Matrix2, Point2};
use rayon::prelude::*;

use crate::image::{FloatImage, RefPatch};
use crate::tracking::mode::RankBy;

/// Candidate correspondence between a reference and a current feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub ref_idx: usize,
    pub cur_idx: usize,
    /// Distance from the prediction to the current keypoint, undistorted.
    pub distance: f32,
    pub ncc: f32,
    /// Search level that produced the candidate (box half-width = level × radius).
    pub level: u32,
}

/// Insert `m` keeping `list` best-first: NCC descending or distance
/// ascending. A new candidate goes ahead of existing ties.
pub fn insert_sorted(list: &mut Vec<Match>, m: Match, rank_by: RankBy) {
    let pos = match rank_by {
        RankBy::Ncc => list.partition_point(|e| e.ncc > m.ncc),
        RankBy::Distance => list.partition_point(|e| e.distance < m.distance),
    };
    list.insert(pos, m);
}

/// Read-only inputs shared by every per-feature search.
pub struct NeighborSearch<'a> {
    pub reference: &'a FloatImage,
    pub current: &'a FloatImage,
    /// Reference keypoints, distorted (patch centers).
    pub keys_ref: &'a [Point2<f64>],
    /// Current keypoints, distorted (patch centers).
    pub keys_cur: &'a [Point2<f64>],
    /// Current keypoints, undistorted (distance to the prediction).
    pub keys_cur_un: &'a [Point2<f64>],
    pub half_patch_size: usize,
    pub base_radius: f64,
    pub rank_by: RankBy,
}

impl NeighborSearch<'_> {
    /// Sorted candidates within the box of half-width `level × base_radius`
    /// around `predicted_un`.
    pub fn candidates(
        &self,
        ref_idx: usize,
        predicted_un: &Point2<f64>,
        affine: &Matrix2<f64>,
        level: u32,
    ) -> Vec<Match> {
        let radius = level as f64 * self.base_radius;
        let patch = RefPatch::extract(self.reference, &self.keys_ref[ref_idx], self.half_patch_size);

        let mut list = Vec::new();
        for (j, cur_un) in self.keys_cur_un.iter().enumerate() {
            let d = predicted_un - cur_un;
            if d.x.abs() > radius || d.y.abs() > radius {
                continue;
            }
            let ncc = patch.ncc(self.current, &self.keys_cur[j], affine);
            let m = Match {
                ref_idx,
                cur_idx: j,
                distance: d.norm() as f32,
                ncc,
                level,
            };
            insert_sorted(&mut list, m, self.rank_by);
        }
        list
    }
}

/// Fill the neighbor list of every valid feature that has none yet.
///
/// Lists already populated at a smaller level are left untouched.
pub fn find_and_sort_near_neighbors(
    search: &NeighborSearch<'_>,
    predicted_un: &[Point2<f64>],
    status: &[bool],
    affine: &[Matrix2<f64>],
    level: u32,
    neighbors: &mut [Vec<Match>],
) {
    neighbors
        .par_iter_mut()
        .enumerate()
        .filter(|(i, list)| status[*i] && list.is_empty())
        .for_each(|(i, list)| {
            *list = search.candidates(i, &predicted_un[i], &affine[i], level);
        });
}

/// Acceptance thresholds for `match_features`.
#[derive(Debug, Clone, Copy)]
pub struct AssociationParams {
    pub rank_by: RankBy,
    pub ncc_high: f32,
    pub ncc_low: f32,
    pub ratio: f32,
}

impl AssociationParams {
    /// Pick the best candidate of a sorted list, or `None` if ambiguous.
    pub fn select(&self, list: &[Match]) -> Option<Match> {
        let first = *list.first()?;
        match self.rank_by {
            RankBy::Ncc => {
                if first.ncc > self.ncc_high {
                    return Some(first);
                }
                let second = list.get(1)?;
                if first.ncc < self.ncc_low {
                    return None;
                }
                (second.ncc < first.ncc * self.ratio).then_some(first)
            }
            RankBy::Distance => match list.get(1) {
                None => Some(first),
                Some(second) => (first.distance < second.distance * self.ratio).then_some(first),
            },
        }
    }
}

/// One-to-one association over all neighbor lists, in reference order.
///
/// A current feature claimed twice is dropped entirely: every match to it is
/// removed and it cannot be claimed again.
pub fn match_features(neighbors: &[Vec<Match>], params: &AssociationParams) -> Vec<Match> {
    let mut matches: Vec<Match> = Vec::new();
    let mut found: HashSet<usize> = HashSet::new();

    for list in neighbors {
        let Some(m) = params.select(list) else {
            continue;
        };
        if found.insert(m.cur_idx) {
            matches.push(m);
        } else {
            matches.retain(|e| e.cur_idx != m.cur_idx);
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(ref_idx: usize, cur_idx: usize, distance: f32, ncc: f32) -> Match {
        Match {
            ref_idx,
            cur_idx,
            distance,
            ncc,
            level: 1,
        }
    }

    fn ncc_params() -> AssociationParams {
        AssociationParams {
            rank_by: RankBy::Ncc,
            ncc_high: 0.6,
            ncc_low: 0.3,
            ratio: 0.75,
        }
    }

    fn distance_params() -> AssociationParams {
        AssociationParams {
            rank_by: RankBy::Distance,
            ..ncc_params()
        }
    }

    #[test]
    fn test_insert_sorted_ncc_descending() {
        let mut list = Vec::new();
        for (j, ncc) in [0.5, 0.9, 0.7, 0.7, 0.1].into_iter().enumerate() {
            insert_sorted(&mut list, cand(0, j, 1.0, ncc), RankBy::Ncc);
        }
        let order: Vec<usize> = list.iter().map(|m| m.cur_idx).collect();
        // The later 0.7 (index 3) lands ahead of the earlier one.
        assert_eq!(order, vec![1, 3, 2, 0, 4]);
    }

    #[test]
    fn test_insert_sorted_distance_ascending() {
        let mut list = Vec::new();
        for (j, d) in [3.0, 1.0, 2.0, 1.0].into_iter().enumerate() {
            insert_sorted(&mut list, cand(0, j, d, 0.0), RankBy::Distance);
        }
        let order: Vec<usize> = list.iter().map(|m| m.cur_idx).collect();
        assert_eq!(order, vec![3, 1, 2, 0]);
    }

    #[test]
    fn test_high_ncc_accepted_outright() {
        let list = vec![cand(0, 4, 3.0, 0.9), cand(0, 5, 1.0, 0.89)];
        assert_eq!(ncc_params().select(&list).map(|m| m.cur_idx), Some(4));
    }

    #[test]
    fn test_ambiguous_mid_ncc_rejected() {
        // 0.35 > 0.4 * 0.75 = 0.3
        let list = vec![cand(0, 1, 1.0, 0.4), cand(0, 2, 1.0, 0.35)];
        assert_eq!(ncc_params().select(&list), None);
    }

    #[test]
    fn test_separated_mid_ncc_accepted() {
        let list = vec![cand(0, 1, 1.0, 0.5), cand(0, 2, 1.0, 0.2)];
        assert_eq!(ncc_params().select(&list).map(|m| m.cur_idx), Some(1));
    }

    #[test]
    fn test_low_ncc_rejected() {
        let list = vec![cand(0, 1, 1.0, 0.25), cand(0, 2, 1.0, 0.01)];
        assert_eq!(ncc_params().select(&list), None);
    }

    #[test]
    fn test_single_mid_ncc_rejected() {
        assert_eq!(ncc_params().select(&[cand(0, 1, 1.0, 0.55)]), None);
        assert_eq!(ncc_params().select(&[]), None);
    }

    #[test]
    fn test_distance_mode() {
        let p = distance_params();
        assert!(p.select(&[cand(0, 1, 7.0, -0.5)]).is_some());
        assert!(p.select(&[cand(0, 1, 1.0, 0.0), cand(0, 2, 2.0, 0.0)]).is_some());
        assert!(p.select(&[cand(0, 1, 1.6, 0.0), cand(0, 2, 2.0, 0.0)]).is_none());
    }

    #[test]
    fn test_collision_removes_all_claims() {
        let neighbors = vec![
            vec![cand(0, 7, 1.0, 0.9)],
            vec![cand(1, 3, 1.0, 0.8)],
            vec![cand(2, 7, 1.0, 0.95)],
            vec![],
            vec![cand(4, 7, 1.0, 0.99)],
        ];
        let matches = match_features(&neighbors, &ncc_params());

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].ref_idx, 1);
    }

    #[test]
    fn test_uniqueness_invariant() {
        let neighbors: Vec<Vec<Match>> = (0..40)
            .map(|i| vec![cand(i, (i * 7) % 13, 1.0, 0.7 + 0.005 * i as f32)])
            .collect();
        let matches = match_features(&neighbors, &ncc_params());

        let mut seen = HashSet::new();
        for m in &matches {
            assert!(seen.insert(m.cur_idx), "current index {} claimed twice", m.cur_idx);
        }
    }

    #[test]
    fn test_search_box_and_skip_populated() {
        let img = FloatImage::from_fn(64, 64, |x, y| ((x * 7 + y * 13) % 31) as f32);
        let keys_ref = vec![Point2::new(20.0, 18.0), Point2::new(40.0, 40.0)];
        let keys_cur = vec![
            Point2::new(24.0, 20.0),
            Point2::new(20.0, 31.0),
            Point2::new(40.0, 40.0),
        ];
        let search = NeighborSearch {
            reference: &img,
            current: &img,
            keys_ref: &keys_ref,
            keys_cur: &keys_cur,
            keys_cur_un: &keys_cur,
            half_patch_size: 2,
            base_radius: 10.0,
            rank_by: RankBy::Distance,
        };
        let affine = vec![Matrix2::identity(); 2];
        let status = vec![true, true];
        let mut neighbors = vec![Vec::new(), vec![cand(1, 2, 0.0, 1.0)]];

        find_and_sort_near_neighbors(&search, &keys_ref, &status, &affine, 1, &mut neighbors);
        assert_eq!(neighbors[0].iter().map(|m| m.cur_idx).collect::<Vec<_>>(), vec![0]);
        assert_eq!(neighbors[1].len(), 1);

        let mut neighbors = vec![Vec::new(), Vec::new()];
        find_and_sort_near_neighbors(&search, &keys_ref, &status, &affine, 2, &mut neighbors);
        assert_eq!(neighbors[0].iter().map(|m| m.cur_idx).collect::<Vec<_>>(), vec![0, 1]);
        assert!(neighbors[0].iter().all(|m| m.level == 2));
        // Same patch at the same place correlates perfectly.
        assert!((neighbors[1][0].ncc - 1.0).abs() < 1e-5);
    }
}
