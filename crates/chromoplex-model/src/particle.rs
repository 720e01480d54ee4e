use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleKind {
    /// A genomic bead with excluded volume.
    Normal,
    /// Pinned helper particle (e.g. the nuclear center); exerts no volume.
    StaticDummy,
    /// Free helper particle, such as a SPRITE cluster centroid.
    DynamicCentroid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Particle {
    pub pos: [f64; 3],
    pub radius: f64,
    pub kind: ParticleKind,
    /// Chain id: beads of one chromosome copy share a chain.
    pub chain: u32,
}

impl Particle {
    pub fn distance(&self, other: &Particle) -> f64 {
        let dx = self.pos[0] - other.pos[0];
        let dy = self.pos[1] - other.pos[1];
        let dz = self.pos[2] - other.pos[2];
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn norm(&self) -> f64 {
        let [x, y, z] = self.pos;
        (x * x + y * y + z * z).sqrt()
    }
}
