use crate::candidate::Candidate;
use crate::knn::{EtaPhi, Neighbor, NeighborIndex, SearchStrategy};
#[cfg(feature = "clap")]
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Statistic used to reduce a neighbour set to scalar features.
///
/// The trained model fixes this choice: it is part of the model's input
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Mean of each neighbour quantity
    #[default]
    Mean,
    /// Minimum and maximum of each neighbour quantity
    Extremes,
    /// Mean, minimum and maximum
    Full,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Aggregation::Mean => write!(f, "mean"),
            Aggregation::Extremes => write!(f, "extremes"),
            Aggregation::Full => write!(f, "full"),
        }
    }
}

/// How neighbour sets shorter than `n_knn` are aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ShortNeighborhood {
    /// Statistics over the neighbours that exist. An empty set gives 0.0.
    #[default]
    Truncate,
    /// Missing neighbours count as 0.0 in every statistic, so means are
    /// divided by `n_knn` and minima drop to 0.0.
    ZeroPad,
}

impl fmt::Display for ShortNeighborhood {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShortNeighborhood::Truncate => write!(f, "truncate"),
            ShortNeighborhood::ZeroPad => write!(f, "zero-pad"),
        }
    }
}

pub const KNN_COUNT: &str = "knn_count";
pub const KINEMATIC_COLUMNS: [&str; 7] =
    ["pt", "eta", "phi", "mass", "energy", "rapidity", "log_pt"];

const MEAN_COLUMNS: [&str; 3] = ["knn_dr_mean", "knn_pt_frac_mean", "knn_e_frac_mean"];
const EXTREME_COLUMNS: [&str; 6] = [
    "knn_dr_min",
    "knn_dr_max",
    "knn_pt_frac_min",
    "knn_pt_frac_max",
    "knn_e_frac_min",
    "knn_e_frac_max",
];

/// Ordered feature columns expected by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    aggregation: Aggregation,
    columns: Vec<&'static str>,
}

impl FeatureSchema {
    pub fn new(aggregation: Aggregation) -> Self {
        let mut columns = Vec::new();
        if matches!(aggregation, Aggregation::Mean | Aggregation::Full) {
            columns.extend(MEAN_COLUMNS);
        }
        if matches!(aggregation, Aggregation::Extremes | Aggregation::Full) {
            columns.extend(EXTREME_COLUMNS);
        }
        columns.push(KNN_COUNT);
        columns.extend(KINEMATIC_COLUMNS);
        Self {
            aggregation,
            columns,
        }
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureOptions {
    pub aggregation: Aggregation,
    pub short_neighborhood: ShortNeighborhood,
    pub search: SearchStrategy,
    /// Run the neighbour searches on the rayon pool
    pub parallel: bool,
    /// Trace every candidate's feature values
    pub debug: bool,
}

/// Column-major features of the processed candidates of one event
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    pub columns: HashMap<String, Vec<f32>>,
    /// `n_candidates * n_knn` neighbour indices in rank order. Slots past the
    /// end of a short neighbour set hold the candidate's own index.
    pub neighbors: Vec<i64>,
    pub n_candidates: usize,
    pub n_knn: usize,
}

impl FeatureMap {
    pub fn column(&self, name: &str) -> Option<&[f32]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Neighbour slots of candidate `i`
    pub fn neighbors_of(&self, i: usize) -> &[i64] {
        &self.neighbors[i * self.n_knn..(i + 1) * self.n_knn]
    }
}

#[derive(Debug, Clone, Copy)]
struct Stat {
    sum: f32,
    min: f32,
    max: f32,
}

impl Stat {
    fn new() -> Self {
        Self {
            sum: 0.0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    fn push(&mut self, value: f32) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn mean(&self, count: usize) -> f32 {
        match count {
            0 => 0.0,
            n => self.sum / n as f32,
        }
    }

    fn min(&self, count: usize) -> f32 {
        match count {
            0 => 0.0,
            _ => self.min,
        }
    }

    fn max(&self, count: usize) -> f32 {
        match count {
            0 => 0.0,
            _ => self.max,
        }
    }
}

/// Share of `other` in the sum of both values, 0 when the sum vanishes
fn fraction(own: f32, other: f32) -> f32 {
    let sum = own + other;
    if sum > 0.0 {
        other / sum
    } else {
        0.0
    }
}

struct Kinematics {
    pt: Vec<f32>,
    energy: Vec<f32>,
}

fn neighborhood_features(
    i: usize,
    neighbors: &[Neighbor],
    kinematics: &Kinematics,
    n_knn: usize,
    options: &FeatureOptions,
    out: &mut Vec<f32>,
) {
    let mut dr = Stat::new();
    let mut pt_frac = Stat::new();
    let mut e_frac = Stat::new();

    for n in neighbors {
        dr.push(n.delta_r);
        pt_frac.push(fraction(kinematics.pt[i], kinematics.pt[n.index]));
        e_frac.push(fraction(kinematics.energy[i], kinematics.energy[n.index]));
    }

    let count = match options.short_neighborhood {
        ShortNeighborhood::Truncate => neighbors.len(),
        ShortNeighborhood::ZeroPad => {
            for _ in neighbors.len()..n_knn {
                dr.push(0.0);
                pt_frac.push(0.0);
                e_frac.push(0.0);
            }
            n_knn
        }
    };

    if matches!(options.aggregation, Aggregation::Mean | Aggregation::Full) {
        out.extend([dr.mean(count), pt_frac.mean(count), e_frac.mean(count)]);
    }
    if matches!(
        options.aggregation,
        Aggregation::Extremes | Aggregation::Full
    ) {
        out.extend([
            dr.min(count),
            dr.max(count),
            pt_frac.min(count),
            pt_frac.max(count),
            e_frac.min(count),
            e_frac.max(count),
        ]);
    }
    out.push(neighbors.len() as f32);
}

fn kinematic_features<C: Candidate>(candidate: &C, out: &mut Vec<f32>) {
    let pt = candidate.pt();
    out.extend([
        pt,
        candidate.eta(),
        candidate.phi(),
        candidate.mass(),
        candidate.energy(),
        candidate.rapidity(),
        pt.max(0.0).ln_1p(),
    ]);
}

/// Build the per-candidate features of one event
///
/// Only the first `n_pf_cands` candidates, in input order, are processed and
/// they only see each other as neighbours. Short collections are valid.
///
/// The neighbour search with [`SearchStrategy::BruteForce`] is O(N²) in the
/// number of processed candidates. Use [`SearchStrategy::Grid`] when N grows
/// well beyond a few hundred.
pub fn make_feature_map<C: Candidate>(
    candidates: &[C],
    n_pf_cands: usize,
    n_knn: usize,
    options: &FeatureOptions,
) -> FeatureMap {
    let candidates = &candidates[..candidates.len().min(n_pf_cands)];
    let n_candidates = candidates.len();

    let points: Vec<EtaPhi> = candidates
        .iter()
        .map(|c| EtaPhi::new(c.eta(), c.phi()))
        .collect();
    let kinematics = Kinematics {
        pt: candidates.iter().map(|c| c.pt()).collect(),
        energy: candidates.iter().map(|c| c.energy()).collect(),
    };

    let index = NeighborIndex::new(&points, options.search);
    let neighbor_sets = index.all_neighbors(n_knn, options.parallel);

    let schema = FeatureSchema::new(options.aggregation);
    let mut columns: Vec<Vec<f32>> = vec![Vec::with_capacity(n_candidates); schema.len()];
    let mut neighbors = Vec::with_capacity(n_candidates * n_knn);
    let mut row = Vec::with_capacity(schema.len());

    for (i, (candidate, set)) in candidates.iter().zip(&neighbor_sets).enumerate() {
        row.clear();
        neighborhood_features(i, set, &kinematics, n_knn, options, &mut row);
        kinematic_features(candidate, &mut row);

        if options.debug {
            let values: Vec<(&str, f32)> =
                schema.columns().iter().copied().zip(row.iter().copied()).collect();
            tracing::debug!(target: "abcnet::features", candidate = i, ?values);
        }

        for (column, value) in columns.iter_mut().zip(&row) {
            column.push(*value);
        }

        neighbors.extend(set.iter().map(|n| n.index as i64));
        neighbors.extend(std::iter::repeat(i as i64).take(n_knn - set.len()));
    }

    let columns = schema
        .columns()
        .iter()
        .map(|name| name.to_string())
        .zip(columns)
        .collect();

    FeatureMap {
        columns,
        neighbors,
        n_candidates,
        n_knn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::PackedCandidate;

    fn close(a: f32, b: f32) -> bool {
        is_close::default().abs_tol(1e-5).is_close(a, b)
    }

    fn options(aggregation: Aggregation, short_neighborhood: ShortNeighborhood) -> FeatureOptions {
        FeatureOptions {
            aggregation,
            short_neighborhood,
            ..Default::default()
        }
    }

    fn three_candidates() -> Vec<PackedCandidate> {
        vec![
            PackedCandidate::new(10.0, 0.0, 0.0, 0.0),
            PackedCandidate::new(30.0, 1.0, 0.0, 0.0),
            PackedCandidate::new(10.0, 0.0, 0.3, 0.0),
        ]
    }

    #[test]
    fn test_schema_columns() {
        let mean = FeatureSchema::new(Aggregation::Mean);
        assert_eq!(mean.len(), 3 + 1 + 7);
        assert_eq!(mean.columns()[0], "knn_dr_mean");
        assert_eq!(mean.columns()[3], KNN_COUNT);
        assert_eq!(mean.columns()[4], "pt");

        let extremes = FeatureSchema::new(Aggregation::Extremes);
        assert_eq!(extremes.len(), 6 + 1 + 7);
        assert_eq!(extremes.columns()[1], "knn_dr_max");

        let full = FeatureSchema::new(Aggregation::Full);
        assert_eq!(full.len(), 3 + 6 + 1 + 7);
    }

    #[test]
    fn test_mean_features() {
        let candidates = three_candidates();
        let map = make_feature_map(
            &candidates,
            3,
            2,
            &options(Aggregation::Mean, ShortNeighborhood::Truncate),
        );

        assert_eq!(map.n_candidates, 3);
        assert_eq!(map.columns.len(), FeatureSchema::new(Aggregation::Mean).len());
        // Candidate 0: neighbours 2 (ΔR 0.3, same pt) then 1 (ΔR 1.0, 3x pt)
        assert_eq!(map.neighbors_of(0), &[2, 1]);
        let dr = map.column("knn_dr_mean").unwrap();
        assert!(close(dr[0], (0.3 + 1.0) / 2.0));
        let pt_frac = map.column("knn_pt_frac_mean").unwrap();
        assert!(close(pt_frac[0], (0.5 + 0.75) / 2.0));
        assert_eq!(map.column(KNN_COUNT).unwrap(), &[2.0, 2.0, 2.0]);
        assert_eq!(map.column("pt").unwrap(), &[10.0, 30.0, 10.0]);
        assert_eq!(map.column("phi").unwrap(), &[0.0, 0.0, 0.3]);
    }

    #[test]
    fn test_extreme_features() {
        let candidates = three_candidates();
        let map = make_feature_map(
            &candidates,
            3,
            2,
            &options(Aggregation::Extremes, ShortNeighborhood::Truncate),
        );

        assert!(map.column("knn_dr_mean").is_none());
        assert!(close(map.column("knn_dr_min").unwrap()[0], 0.3));
        assert!(close(map.column("knn_dr_max").unwrap()[0], 1.0));
        assert!(close(map.column("knn_pt_frac_min").unwrap()[0], 0.5));
        assert!(close(map.column("knn_pt_frac_max").unwrap()[0], 0.75));
        // Candidate 1 only sees softer neighbours
        assert!(close(map.column("knn_pt_frac_max").unwrap()[1], 0.25));
    }

    #[test]
    fn test_single_candidate_truncate() {
        let candidates = vec![PackedCandidate::new(5.0, 0.2, -1.0, 0.0)];
        let map = make_feature_map(
            &candidates,
            10,
            5,
            &options(Aggregation::Full, ShortNeighborhood::Truncate),
        );

        assert_eq!(map.n_candidates, 1);
        for name in MEAN_COLUMNS.iter().chain(EXTREME_COLUMNS.iter()) {
            assert_eq!(map.column(name).unwrap(), &[0.0], "{name}");
        }
        assert_eq!(map.column(KNN_COUNT).unwrap(), &[0.0]);
        // Every slot points back at the candidate itself
        assert_eq!(map.neighbors, vec![0; 5]);
    }

    #[test]
    fn test_short_neighborhood_policies_differ() {
        // Two candidates, n_knn = 3: each has a single real neighbour
        let candidates = vec![
            PackedCandidate::new(10.0, 0.0, 0.0, 0.0),
            PackedCandidate::new(30.0, 0.4, 0.0, 0.0),
        ];

        let truncated = make_feature_map(
            &candidates,
            2,
            3,
            &options(Aggregation::Full, ShortNeighborhood::Truncate),
        );
        let padded = make_feature_map(
            &candidates,
            2,
            3,
            &options(Aggregation::Full, ShortNeighborhood::ZeroPad),
        );

        assert!(close(truncated.column("knn_dr_mean").unwrap()[0], 0.4));
        assert!(close(truncated.column("knn_dr_min").unwrap()[0], 0.4));
        assert!(close(truncated.column("knn_pt_frac_mean").unwrap()[0], 0.75));

        // Zero padding dilutes the mean by n_knn and pulls the minimum to zero
        assert!(close(padded.column("knn_dr_mean").unwrap()[0], 0.4 / 3.0));
        assert_eq!(padded.column("knn_dr_min").unwrap()[0], 0.0);
        assert!(close(padded.column("knn_dr_max").unwrap()[0], 0.4));
        assert!(close(padded.column("knn_pt_frac_mean").unwrap()[0], 0.25));

        // The effective count is reported either way
        assert_eq!(truncated.column(KNN_COUNT).unwrap(), &[1.0, 1.0]);
        assert_eq!(padded.column(KNN_COUNT).unwrap(), &[1.0, 1.0]);
        assert_eq!(truncated.neighbors, vec![1, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_only_first_n_pf_cands_processed() {
        let candidates = vec![
            PackedCandidate::new(1.0, 0.0, 0.0, 0.0),
            PackedCandidate::new(2.0, 2.0, 0.0, 0.0),
            // Would be the closest neighbour of candidate 0 if eligible
            PackedCandidate::new(3.0, 0.01, 0.0, 0.0),
        ];
        let map = make_feature_map(&candidates, 2, 1, &FeatureOptions::default());

        assert_eq!(map.n_candidates, 2);
        assert_eq!(map.neighbors, vec![1, 0]);
        assert_eq!(map.column("pt").unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_empty_collection() {
        let candidates: Vec<PackedCandidate> = Vec::new();
        let map = make_feature_map(&candidates, 100, 8, &FeatureOptions::default());

        assert_eq!(map.n_candidates, 0);
        assert!(map.neighbors.is_empty());
        assert!(map.columns.values().all(|c| c.is_empty()));
    }

    #[test]
    fn test_parallel_and_grid_give_same_map() {
        let candidates: Vec<PackedCandidate> = (0..120)
            .map(|i| {
                let x = i as f32;
                PackedCandidate::new(
                    1.0 + (x * 0.37).sin().abs() * 20.0,
                    (x * 0.11).sin() * 2.4,
                    (x * 1.7).sin() * 3.1,
                    0.0,
                )
            })
            .collect();

        let sequential = make_feature_map(&candidates, 100, 8, &FeatureOptions::default());
        let parallel = make_feature_map(
            &candidates,
            100,
            8,
            &FeatureOptions {
                parallel: true,
                search: SearchStrategy::Grid { cell_size: 0.4 },
                ..Default::default()
            },
        );
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_input_not_mutated() {
        let candidates = three_candidates();
        let before = candidates.clone();
        let _ = make_feature_map(
            &candidates,
            3,
            2,
            &FeatureOptions {
                debug: true,
                ..Default::default()
            },
        );
        assert_eq!(candidates, before);
    }
}
