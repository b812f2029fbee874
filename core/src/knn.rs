//! k-nearest-neighbour search in pseudorapidity-azimuth space
//!
//! Neighbour sets are ordered by increasing ΔR, ties broken by the input
//! candidate index, and never contain the query candidate itself. When fewer
//! than `k` other candidates exist the set is simply shorter.
//!
//! [`SearchStrategy::BruteForce`] costs O(N²) per event, which is fine for
//! the few hundred candidates of a typical event. [`SearchStrategy::Grid`]
//! bins candidates in (η, φ) and only visits the cells that can still hold a
//! closer neighbour; it returns exactly the brute-force result.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::f32::consts::{PI, TAU};

/// Azimuthal difference `a - b` wrapped into [-π, π]
///
/// `delta_phi(b, a)` is exactly `-delta_phi(a, b)`.
pub fn delta_phi(a: f32, b: f32) -> f32 {
    let d = a - b;
    if !d.is_finite() || d.abs() <= PI {
        return d;
    }
    let mut wrapped = d.abs() % TAU;
    if wrapped > PI {
        wrapped -= TAU;
    }
    if d < 0.0 {
        -wrapped
    } else {
        wrapped
    }
}

/// Angular distance between two points in (η, φ)
pub fn delta_r(a: EtaPhi, b: EtaPhi) -> f32 {
    let deta = a.eta - b.eta;
    let dphi = delta_phi(a.phi, b.phi);
    (deta * deta + dphi * dphi).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaPhi {
    pub eta: f32,
    pub phi: f32,
}

impl EtaPhi {
    pub fn new(eta: f32, phi: f32) -> Self {
        Self { eta, phi }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub delta_r: f32,
}

pub type NeighborSet = Vec<Neighbor>;

fn by_distance(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.delta_r
        .total_cmp(&b.delta_r)
        .then(a.index.cmp(&b.index))
}

/// Keep the `k` closest entries of `pool`, sorted
fn select_nearest(mut pool: Vec<Neighbor>, k: usize) -> NeighborSet {
    if k == 0 {
        return Vec::new();
    }
    if pool.len() > k {
        pool.select_nth_unstable_by(k - 1, by_distance);
        pool.truncate(k);
    }
    pool.sort_unstable_by(by_distance);
    pool
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    #[default]
    BruteForce,
    /// Exact search over square (η, φ) cells of side `cell_size`
    Grid { cell_size: f32 },
}

/// Neighbour lookup over the eligible candidates of one event
pub struct NeighborIndex<'a> {
    points: &'a [EtaPhi],
    grid: Option<Grid>,
}

impl<'a> NeighborIndex<'a> {
    pub fn new(points: &'a [EtaPhi], strategy: SearchStrategy) -> Self {
        let grid = match strategy {
            SearchStrategy::BruteForce => None,
            SearchStrategy::Grid { cell_size } => {
                if cell_size.is_finite() && cell_size > 0.0 && !points.is_empty() {
                    Some(Grid::new(points, cell_size))
                } else {
                    None
                }
            }
        };
        Self { points, grid }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Up to `k` nearest neighbours of point `i`
    pub fn neighbors(&self, i: usize, k: usize) -> NeighborSet {
        if k == 0 {
            return Vec::new();
        }
        match &self.grid {
            Some(grid) => grid.neighbors(self.points, i, k),
            None => self.brute_force(i, k),
        }
    }

    /// Neighbour sets of every point. Each query only reads the shared
    /// points, so the parallel path gives the same result.
    pub fn all_neighbors(&self, k: usize, parallel: bool) -> Vec<NeighborSet> {
        if parallel {
            (0..self.points.len())
                .into_par_iter()
                .map(|i| self.neighbors(i, k))
                .collect()
        } else {
            (0..self.points.len())
                .map(|i| self.neighbors(i, k))
                .collect()
        }
    }

    fn brute_force(&self, i: usize, k: usize) -> NeighborSet {
        let query = self.points[i];
        let pool = self
            .points
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(j, p)| Neighbor {
                index: j,
                delta_r: delta_r(query, *p),
            })
            .collect();
        select_nearest(pool, k)
    }
}

const MAX_BINS: usize = 1024;

struct Grid {
    eta_min: f32,
    eta_width: f32,
    phi_width: f32,
    n_eta: usize,
    n_phi: usize,
    /// `offsets[c]..offsets[c + 1]` is the range of `order` holding cell `c`
    offsets: Vec<usize>,
    /// Point indices sorted by cell, ascending within a cell
    order: Vec<usize>,
}

impl Grid {
    fn new(points: &[EtaPhi], cell_size: f32) -> Self {
        let (eta_min, eta_max) = points
            .iter()
            .filter(|p| p.eta.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.eta), hi.max(p.eta))
            });
        let (eta_min, eta_max) = match eta_min <= eta_max {
            true => (eta_min, eta_max),
            false => (0.0, 0.0),
        };

        // Bin counts are bounded before leaving f32 so tiny cells cannot overflow
        let eta_range = eta_max - eta_min;
        let eta_width = cell_size.max(eta_range / (MAX_BINS - 1) as f32);
        let n_eta = (eta_range / eta_width)
            .floor()
            .clamp(0.0, (MAX_BINS - 1) as f32) as usize
            + 1;
        let n_phi = (TAU / cell_size).floor().clamp(1.0, MAX_BINS as f32) as usize;
        let phi_width = TAU / n_phi as f32;

        let mut grid = Self {
            eta_min,
            eta_width,
            phi_width,
            n_eta,
            n_phi,
            offsets: Vec::new(),
            order: Vec::new(),
        };

        // Counting sort of the points by cell keeps indices ascending per cell
        let cells: Vec<usize> = points.iter().map(|p| grid.cell_index(*p)).collect();
        let mut offsets = vec![0; n_eta * n_phi + 1];
        for &cell in &cells {
            offsets[cell + 1] += 1;
        }
        let mut total = 0;
        for offset in offsets.iter_mut() {
            total += *offset;
            *offset = total;
        }
        let mut next = offsets.clone();
        let mut order = vec![0; points.len()];
        for (i, &cell) in cells.iter().enumerate() {
            order[next[cell]] = i;
            next[cell] += 1;
        }

        grid.offsets = offsets;
        grid.order = order;
        grid
    }

    fn cell_of(&self, p: EtaPhi) -> (usize, usize) {
        // NaN and out of range coordinates saturate into the edge cells
        let eta_bin = (((p.eta - self.eta_min) / self.eta_width).floor().max(0.0) as usize)
            .min(self.n_eta - 1);
        let phi = delta_phi(p.phi, 0.0);
        let phi_bin = (((phi + PI) / self.phi_width).floor().max(0.0) as usize).min(self.n_phi - 1);
        (eta_bin, phi_bin)
    }

    fn cell_index(&self, p: EtaPhi) -> usize {
        let (eta_bin, phi_bin) = self.cell_of(p);
        eta_bin * self.n_phi + phi_bin
    }

    fn cell(&self, eta_bin: usize, phi_bin: usize) -> &[usize] {
        let c = eta_bin * self.n_phi + phi_bin;
        &self.order[self.offsets[c]..self.offsets[c + 1]]
    }

    /// Walk outward ring by ring around the query cell.
    ///
    /// φ offsets are taken in `-phi_below..=phi_above`, one representative per
    /// φ bin, so every cell belongs to exactly one ring and no bookkeeping of
    /// visited cells is needed.
    fn neighbors(&self, points: &[EtaPhi], i: usize, k: usize) -> NeighborSet {
        let query = points[i];
        let (qe, qp) = self.cell_of(query);
        let phi_below = (self.n_phi as isize - 1) / 2;
        let phi_above = self.n_phi as isize / 2;
        let max_ring = qe.max(self.n_eta - 1 - qe).max(phi_above as usize);
        let n_others = points.len() - 1;

        let mut pool: Vec<Neighbor> = Vec::new();
        let mut found = 0;
        let visit = |de: isize, dp: isize, pool: &mut Vec<Neighbor>| -> usize {
            let eta_bin = qe as isize + de;
            if eta_bin < 0 || eta_bin >= self.n_eta as isize {
                return 0;
            }
            let phi_bin = (qp as isize + dp).rem_euclid(self.n_phi as isize);
            let before = pool.len();
            pool.extend(
                self.cell(eta_bin as usize, phi_bin as usize)
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| Neighbor {
                        index: j,
                        delta_r: delta_r(query, points[j]),
                    }),
            );
            pool.len() - before
        };

        for ring in 0..=max_ring {
            let r = ring as isize;
            let dp_lo = (-r).max(-phi_below);
            let dp_hi = r.min(phi_above);
            let de_lo = (-r).max(-(qe as isize));
            let de_hi = r.min((self.n_eta - 1 - qe) as isize);
            for de in de_lo..=de_hi {
                if de.abs() == r {
                    for dp in dp_lo..=dp_hi {
                        found += visit(de, dp, &mut pool);
                    }
                } else {
                    if r <= phi_below {
                        found += visit(de, -r, &mut pool);
                    }
                    if r <= phi_above {
                        found += visit(de, r, &mut pool);
                    }
                }
            }

            if found == n_others {
                break;
            }

            // Any point outside rings 0..=ring is at least `ring` cells away.
            // One ring of slack absorbs round-off in the binning.
            let bound = ring.saturating_sub(1) as f32 * self.eta_width.min(self.phi_width);
            if pool.len() >= k {
                pool = select_nearest(pool, k);
                if pool[k - 1].delta_r < bound {
                    return pool;
                }
            }
        }

        select_nearest(pool, k)
    }
}
