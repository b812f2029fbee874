//! Particle candidates as seen by the weight producer
//!
//! Anything exposing kinematic accessors can feed the feature builder. Only
//! [`PackedCandidate`] can be rescaled, so the weight applicator asks for it
//! through [`Candidate::packed`].

use serde::{Deserialize, Serialize};

pub trait Candidate {
    fn px(&self) -> f32;
    fn py(&self) -> f32;
    fn pz(&self) -> f32;
    fn energy(&self) -> f32;
    fn pt(&self) -> f32;
    fn eta(&self) -> f32;
    fn rapidity(&self) -> f32;
    fn phi(&self) -> f32;
    fn mass(&self) -> f32;

    /// Checked access to the packed kinematic representation
    fn packed(&self) -> Option<&PackedCandidate> {
        None
    }
}

/// Candidate stored with a polar four-momentum (pt, eta, phi, mass)
///
/// Rapidity is cached at construction so that it survives rescaling to a
/// null four-momentum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PolarP4")]
pub struct PackedCandidate {
    pub pt: f32,
    pub eta: f32,
    pub phi: f32,
    pub mass: f32,
    pub charge: i8,
    pub pdg_id: i32,
    #[serde(skip_serializing)]
    rapidity: f32,
}

#[derive(Deserialize)]
struct PolarP4 {
    pt: f32,
    eta: f32,
    phi: f32,
    mass: f32,
    #[serde(default)]
    charge: i8,
    #[serde(default)]
    pdg_id: i32,
}

impl From<PolarP4> for PackedCandidate {
    fn from(p4: PolarP4) -> Self {
        PackedCandidate::new(p4.pt, p4.eta, p4.phi, p4.mass).with_charge(p4.charge, p4.pdg_id)
    }
}

impl PackedCandidate {
    pub fn new(pt: f32, eta: f32, phi: f32, mass: f32) -> Self {
        let rapidity = polar_rapidity(pt, eta, mass);
        Self {
            pt,
            eta,
            phi,
            mass,
            charge: 0,
            pdg_id: 0,
            rapidity,
        }
    }

    pub fn with_charge(mut self, charge: i8, pdg_id: i32) -> Self {
        self.charge = charge;
        self.pdg_id = pdg_id;
        self
    }

    /// Copy of this candidate with its four-momentum multiplied by `weight`
    ///
    /// Angular coordinates (eta, phi, rapidity) are carried over unchanged.
    pub fn scaled(&self, weight: f32) -> Self {
        Self {
            pt: weight * self.pt,
            mass: weight * self.mass,
            ..self.clone()
        }
    }
}

fn polar_rapidity(pt: f32, eta: f32, mass: f32) -> f32 {
    if mass == 0.0 {
        return eta;
    }
    let pz = pt * eta.sinh();
    let e = (pt * pt * eta.cosh().powi(2) + mass * mass).sqrt();
    if e <= pz.abs() {
        return eta;
    }
    0.5 * ((e + pz) / (e - pz)).ln()
}

impl Candidate for PackedCandidate {
    fn px(&self) -> f32 {
        self.pt * self.phi.cos()
    }

    fn py(&self) -> f32 {
        self.pt * self.phi.sin()
    }

    fn pz(&self) -> f32 {
        self.pt * self.eta.sinh()
    }

    fn energy(&self) -> f32 {
        let p = self.pt * self.eta.cosh();
        (p * p + self.mass * self.mass).sqrt()
    }

    fn pt(&self) -> f32 {
        self.pt
    }

    fn eta(&self) -> f32 {
        self.eta
    }

    fn rapidity(&self) -> f32 {
        self.rapidity
    }

    fn phi(&self) -> f32 {
        self.phi
    }

    fn mass(&self) -> f32 {
        self.mass
    }

    fn packed(&self) -> Option<&PackedCandidate> {
        Some(self)
    }
}

/// Candidate stored with a cartesian four-momentum
///
/// It has no packed representation and cannot be reweighted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoCandidate {
    pub px: f32,
    pub py: f32,
    pub pz: f32,
    pub energy: f32,
}

impl Candidate for RecoCandidate {
    fn px(&self) -> f32 {
        self.px
    }

    fn py(&self) -> f32 {
        self.py
    }

    fn pz(&self) -> f32 {
        self.pz
    }

    fn energy(&self) -> f32 {
        self.energy
    }

    fn pt(&self) -> f32 {
        self.px.hypot(self.py)
    }

    fn eta(&self) -> f32 {
        let pt = self.pt();
        if pt == 0.0 {
            return 0.0;
        }
        (self.pz / pt).asinh()
    }

    fn rapidity(&self) -> f32 {
        if self.energy <= self.pz.abs() {
            return self.eta();
        }
        0.5 * ((self.energy + self.pz) / (self.energy - self.pz)).ln()
    }

    fn phi(&self) -> f32 {
        if self.px == 0.0 && self.py == 0.0 {
            return 0.0;
        }
        self.py.atan2(self.px)
    }

    fn mass(&self) -> f32 {
        let p2 = self.px * self.px + self.py * self.py + self.pz * self.pz;
        (self.energy * self.energy - p2).max(0.0).sqrt()
    }
}

/// Candidate as delivered by the host, in either representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnyCandidate {
    Packed(PackedCandidate),
    Reco(RecoCandidate),
}

macro_rules! forward {
    ($($name:ident),*) => {
        $(
            fn $name(&self) -> f32 {
                match self {
                    AnyCandidate::Packed(c) => c.$name(),
                    AnyCandidate::Reco(c) => c.$name(),
                }
            }
        )*
    };
}

impl Candidate for AnyCandidate {
    forward!(px, py, pz, energy, pt, eta, rapidity, phi, mass);

    fn packed(&self) -> Option<&PackedCandidate> {
        match self {
            AnyCandidate::Packed(c) => Some(c),
            AnyCandidate::Reco(_) => None,
        }
    }
}
