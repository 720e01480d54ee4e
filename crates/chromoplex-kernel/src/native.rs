//! Built-in minimizer: damped Langevin dynamics followed by a
//! gradient-descent refinement, evaluating the typed restraints directly.
//!
//! The force field mirrors the kernel contract: half-harmonic bounds,
//! soft-core excluded volume with amplitude `(cutoff/pi)^2 * evfactor`,
//! elliptic/volumetric envelopes and body exclusions. Dummy particles are
//! pinned; centroids move freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use chromoplex_common::{Error, Result};
use chromoplex_config::OptimizerOptions;
use chromoplex_model::{Model, ParticleKind, Restraint, VoxelMap};

use crate::{Kernel, KernelStats, RunInfo};

const PI: f64 = std::f64::consts::PI;

#[derive(Default)]
pub struct NativeKernel;

struct Bond {
    i: usize,
    j: usize,
    dist: f64,
    k: f64,
    lower: bool,
}

struct Ellipse {
    beads: Vec<usize>,
    semiaxes: [f64; 3],
    k: f64,
}

struct VoxEnvelope {
    beads: Vec<usize>,
    map: Arc<VoxelMap>,
    k: f64,
}

struct BodyExclusion {
    beads: Vec<usize>,
    center: [f64; 3],
    radius: f64,
    k: f64,
}

struct ForceField {
    bonds: Vec<Bond>,
    ev_beads: Vec<usize>,
    ev_k: f64,
    ellipses: Vec<Ellipse>,
    voxmaps: Vec<VoxEnvelope>,
    bodies: Vec<BodyExclusion>,
    radii: Vec<f64>,
    movable: Vec<bool>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Energies {
    pair: f64,
    bond: f64,
    other: f64,
}

impl Energies {
    fn total(&self) -> f64 {
        self.pair + self.bond + self.other
    }
}

impl ForceField {
    fn build(model: &Model) -> Self {
        let radii: Vec<f64> = model.particles.iter().map(|p| p.radius).collect();
        let movable: Vec<bool> =
            model.particles.iter().map(|p| p.kind != ParticleKind::StaticDummy).collect();

        let mut ff = ForceField {
            bonds: Vec::new(),
            ev_beads: Vec::new(),
            ev_k: 0.0,
            ellipses: Vec::new(),
            voxmaps: Vec::new(),
            bodies: Vec::new(),
            radii,
            movable,
        };

        for r in &model.restraints {
            match r {
                Restraint::ExcludedVolume { beads, k } => {
                    ff.ev_beads = beads.clone();
                    ff.ev_k = *k;
                }
                Restraint::HarmonicUpperBound { i, j, dist, k, .. } => {
                    ff.bonds.push(Bond { i: *i, j: *j, dist: *dist, k: *k, lower: false });
                }
                Restraint::HarmonicLowerBound { i, j, dist, k, .. } => {
                    ff.bonds.push(Bond { i: *i, j: *j, dist: *dist, k: *k, lower: true });
                }
                Restraint::EllipticEnvelope { beads, semiaxes, k, .. } => {
                    ff.ellipses.push(Ellipse { beads: beads.clone(), semiaxes: *semiaxes, k: *k });
                }
                Restraint::VolumetricEnvelope { beads, map, k, .. } => {
                    ff.voxmaps.push(VoxEnvelope { beads: beads.clone(), map: map.clone(), k: *k });
                }
                Restraint::BodyExcludedVolume { beads, center, radius, k } => {
                    ff.bodies.push(BodyExclusion {
                        beads: beads.clone(),
                        center: *center,
                        radius: *radius,
                        k: *k,
                    });
                }
            }
        }
        ff
    }

    /// Evaluate energies and accumulate forces. `ev_scale` multiplies the
    /// excluded-volume amplitude (the ramp hook).
    fn eval(&self, pos: &[[f64; 3]], ev_scale: f64, forces: &mut [[f64; 3]]) -> Energies {
        for f in forces.iter_mut() {
            *f = [0.0; 3];
        }
        let mut e = Energies::default();

        // pair bounds
        for b in &self.bonds {
            let d = sub(pos[b.i], pos[b.j]);
            let r = norm(d).max(1e-12);
            let t = if b.lower { b.dist - r } else { r - b.dist };
            if t > 0.0 {
                e.bond += 0.5 * b.k * t * t;
                // gradient magnitude k*t along the pair axis
                let sign = if b.lower { 1.0 } else { -1.0 };
                let f = scale(d, sign * b.k * t / r);
                add_assign(&mut forces[b.i], f);
                add_assign(&mut forces[b.j], neg(f));
            }
        }

        // soft-core excluded volume via a uniform cell grid
        if !self.ev_beads.is_empty() && self.ev_k * ev_scale != 0.0 {
            let max_r = self.ev_beads.iter().map(|&i| self.radii[i]).fold(0.0, f64::max);
            let cell = (2.0 * max_r).max(1e-9);
            let mut grid: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
            for &i in &self.ev_beads {
                grid.entry(cell_of(pos[i], cell)).or_default().push(i);
            }
            for &i in &self.ev_beads {
                let (cx, cy, cz) = cell_of(pos[i], cell);
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            let Some(neigh) = grid.get(&(cx + dx, cy + dy, cz + dz)) else {
                                continue;
                            };
                            for &j in neigh {
                                if j <= i {
                                    continue;
                                }
                                let cutoff = self.radii[i] + self.radii[j];
                                let d = sub(pos[i], pos[j]);
                                let r = norm(d);
                                if r < cutoff && r > 1e-12 {
                                    let amp =
                                        self.ev_k * ev_scale * (cutoff / PI) * (cutoff / PI);
                                    e.pair += amp * (1.0 + (PI * r / cutoff).cos());
                                    let fmag = amp * PI / cutoff * (PI * r / cutoff).sin();
                                    let f = scale(d, fmag / r);
                                    add_assign(&mut forces[i], f);
                                    add_assign(&mut forces[j], neg(f));
                                }
                            }
                        }
                    }
                }
            }
        }

        // elliptic envelopes (contain when k > 0, expel when k < 0)
        for env in &self.ellipses {
            for &i in &env.beads {
                let a = (env.semiaxes[0] - self.radii[i]).max(f64::EPSILON);
                let b = (env.semiaxes[1] - self.radii[i]).max(f64::EPSILON);
                let c = (env.semiaxes[2] - self.radii[i]).max(f64::EPSILON);
                let s = ((pos[i][0] / a).powi(2)
                    + (pos[i][1] / b).powi(2)
                    + (pos[i][2] / c).powi(2))
                .sqrt();
                let r_eff = (a * b * c).cbrt();
                let t = if env.k >= 0.0 { (s - 1.0) * r_eff } else { (1.0 - s) * r_eff };
                if t > 0.0 && s > 1e-12 {
                    let kk = env.k.abs();
                    e.other += 0.5 * kk * t * t;
                    // dt/dx = +- r_eff * x_d / (a_d^2 * s)
                    let sgn = if env.k >= 0.0 { 1.0 } else { -1.0 };
                    let grad = [
                        sgn * r_eff * pos[i][0] / (a * a * s),
                        sgn * r_eff * pos[i][1] / (b * b * s),
                        sgn * r_eff * pos[i][2] / (c * c * s),
                    ];
                    add_assign(&mut forces[i], scale(grad, -kk * t));
                }
            }
        }

        // volumetric envelopes
        for env in &self.voxmaps {
            for &i in &env.beads {
                let d = env.map.signed_distance(pos[i]);
                let t = if env.k >= 0.0 { d.max(0.0) } else { (-d).max(0.0) };
                if t > 0.0 {
                    let kk = env.k.abs();
                    e.other += 0.5 * kk * t * t;
                    let g = env.map.gradient(pos[i]);
                    let sgn = if env.k >= 0.0 { 1.0 } else { -1.0 };
                    add_assign(&mut forces[i], scale(g, -sgn * kk * t));
                }
            }
        }

        // nuclear bodies
        for body in &self.bodies {
            for &i in &body.beads {
                let d = sub(pos[i], body.center);
                let r = norm(d).max(1e-12);
                let t = body.radius + self.radii[i] - r;
                if t > 0.0 {
                    e.other += 0.5 * body.k * t * t;
                    add_assign(&mut forces[i], scale(d, body.k * t / r));
                }
            }
        }

        e
    }
}

impl Kernel for NativeKernel {
    fn optimize(
        &self,
        model: &mut Model,
        opts: &OptimizerOptions,
        run: &RunInfo,
    ) -> Result<KernelStats> {
        let started = Instant::now();
        let ff = ForceField::build(model);
        let n = model.particles.len();
        let mut pos: Vec<[f64; 3]> = model.particles.iter().map(|p| p.pos).collect();
        let mut vel = vec![[0.0; 3]; n];
        let mut forces = vec![[0.0; 3]; n];
        let mut rng = StdRng::seed_from_u64(run.seed);

        let deadline = Deadline {
            started,
            limit: if opts.max_wall_time > 0 {
                Some(std::time::Duration::from_secs(opts.max_wall_time))
            } else {
                None
            },
            run_name: run.run_name.clone(),
            max_wall_time: opts.max_wall_time,
        };

        let mut thermo = std::collections::BTreeMap::new();

        // annealing stages at fixed temperature
        for &(temp, steps) in &opts.annealing {
            md_run(
                &ff, &mut pos, &mut vel, &mut forces, &mut rng, opts, temp, temp, steps, 1.0,
                &mut thermo, &deadline,
            )?;
        }

        // main run, optionally ramping the excluded volume
        let md_started = Instant::now();
        if opts.ev_step > 1 {
            let dv = (opts.ev_stop - opts.ev_start) / (opts.ev_step - 1) as f64;
            for step in 0..opts.ev_step {
                let ev_scale = opts.ev_start + dv * step as f64;
                md_run(
                    &ff,
                    &mut pos,
                    &mut vel,
                    &mut forces,
                    &mut rng,
                    opts,
                    opts.tstart,
                    opts.tstop,
                    opts.mdsteps,
                    ev_scale,
                    &mut thermo,
                    &deadline,
                )?;
            }
        } else {
            md_run(
                &ff,
                &mut pos,
                &mut vel,
                &mut forces,
                &mut rng,
                opts,
                opts.tstart,
                opts.tstop,
                opts.mdsteps,
                1.0,
                &mut thermo,
                &deadline,
            )?;
        }
        let md_time = md_started.elapsed().as_secs_f64();

        // gradient refinement
        let energies = minimize(&ff, &mut pos, &mut forces, opts);
        deadline.check()?;

        for (p, x) in model.particles.iter_mut().zip(&pos) {
            p.pos = *x;
        }

        debug!(
            run = %run.run_name,
            final_energy = energies.total(),
            md_time,
            "kernel run complete"
        );

        Ok(KernelStats {
            final_energy: energies.total(),
            pair_energy: energies.pair,
            bond_energy: energies.bond,
            md_time,
            thermo,
        })
    }
}

struct Deadline {
    started: Instant,
    limit: Option<std::time::Duration>,
    run_name: String,
    max_wall_time: u64,
}

impl Deadline {
    fn check(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.started.elapsed() > limit {
                return Err(Error::Kernel(format!(
                    "run {} exceeded wall time limit of {}s",
                    self.run_name, self.max_wall_time
                )));
            }
        }
        Ok(())
    }
}

/// Langevin dynamics with a velocity cap, linear temperature ramp.
#[allow(clippy::too_many_arguments)]
fn md_run(
    ff: &ForceField,
    pos: &mut [[f64; 3]],
    vel: &mut [[f64; 3]],
    forces: &mut [[f64; 3]],
    rng: &mut StdRng,
    opts: &OptimizerOptions,
    tstart: f64,
    tstop: f64,
    steps: u32,
    ev_scale: f64,
    thermo: &mut std::collections::BTreeMap<String, f64>,
    deadline: &Deadline,
) -> Result<()> {
    if steps == 0 {
        return Ok(());
    }
    let dt = opts.timestep;
    let gamma = 1.0 / opts.damp.max(1e-9);
    for step in 0..steps {
        if step % 1024 == 0 {
            deadline.check()?;
        }
        let temp = tstart + (tstop - tstart) * step as f64 / steps as f64;
        let e = ff.eval(pos, ev_scale, forces);
        let noise_amp = (2.0 * gamma * temp / dt).sqrt();
        let mut ke = 0.0;
        for i in 0..pos.len() {
            if !ff.movable[i] {
                continue;
            }
            for d in 0..3 {
                let xi: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                let a = forces[i][d] - gamma * vel[i][d] + noise_amp * xi;
                vel[i][d] += a * dt;
            }
            // cap speed the way nve/limit caps displacement
            let speed = norm(vel[i]);
            if speed > opts.max_velocity {
                vel[i] = scale(vel[i], opts.max_velocity / speed);
            }
            for d in 0..3 {
                pos[i][d] += vel[i][d] * dt;
            }
            ke += 0.5 * dot(vel[i], vel[i]);
        }
        if opts.thermo > 0 && (step % opts.thermo == 0 || step + 1 == steps) {
            let dof = (3 * pos.len()).max(1) as f64;
            thermo.insert("temp".into(), 2.0 * ke / dof);
            thermo.insert("epair".into(), e.pair);
            thermo.insert("ebond".into(), e.bond);
            thermo.insert("eother".into(), e.other);
        }
    }
    Ok(())
}

/// Steepest descent with adaptive step size until the energy or force
/// tolerance is reached.
fn minimize(
    ff: &ForceField,
    pos: &mut [[f64; 3]],
    forces: &mut [[f64; 3]],
    opts: &OptimizerOptions,
) -> Energies {
    let mut energies = ff.eval(pos, 1.0, forces);
    let mut alpha = 0.1;
    for _ in 0..opts.max_cg_iter {
        let fmax = forces
            .iter()
            .zip(&ff.movable)
            .filter(|(_, &m)| m)
            .map(|(f, _)| norm(*f))
            .fold(0.0, f64::max);
        if fmax < opts.ftol {
            break;
        }
        let trial: Vec<[f64; 3]> = pos
            .iter()
            .enumerate()
            .map(|(i, x)| {
                if ff.movable[i] {
                    let step = scale(forces[i], alpha / fmax.max(1e-12));
                    [x[0] + step[0], x[1] + step[1], x[2] + step[2]]
                } else {
                    *x
                }
            })
            .collect();
        let mut trial_forces = vec![[0.0; 3]; pos.len()];
        let trial_e = ff.eval(&trial, 1.0, &mut trial_forces);
        if trial_e.total() < energies.total() {
            let improvement = energies.total() - trial_e.total();
            pos.copy_from_slice(&trial);
            forces.copy_from_slice(&trial_forces);
            let rel = improvement / energies.total().abs().max(1e-12);
            energies = trial_e;
            alpha = (alpha * 1.2).min(100.0);
            if rel < opts.etol {
                break;
            }
        } else {
            alpha *= 0.5;
            if alpha < 1e-12 {
                break;
            }
        }
    }
    energies
}

fn cell_of(p: [f64; 3], cell: f64) -> (i64, i64, i64) {
    (
        (p[0] / cell).floor() as i64,
        (p[1] / cell).floor() as i64,
        (p[2] / cell).floor() as i64,
    )
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn neg(a: [f64; 3]) -> [f64; 3] {
    [-a[0], -a[1], -a[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn add_assign(a: &mut [f64; 3], b: [f64; 3]) {
    a[0] += b[0];
    a[1] += b[1];
    a[2] += b[2];
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_model::builders;
    use chromoplex_model::RestraintOrigin;

    fn quiet_opts() -> OptimizerOptions {
        OptimizerOptions {
            mdsteps: 500,
            timestep: 0.1,
            tstart: 1.0,
            tstop: 0.01,
            damp: 5.0,
            max_velocity: 50.0,
            max_cg_iter: 2000,
            etol: 1e-10,
            ftol: 1e-8,
            ..Default::default()
        }
    }

    fn run_info(seed: u64) -> RunInfo {
        RunInfo {
            run_name: "test".into(),
            tmp_dir: std::env::temp_dir(),
            seed,
            keep_temporary_files: false,
        }
    }

    #[test]
    fn two_beads_relax_into_bond_and_envelope() {
        // two beads of radius 100 at (+-500, 0, 0) in a sphere of radius
        // 1000, bonded with contact range 2
        let mut model = Model::new();
        model.add_particle([-500.0, 0.0, 0.0], 100.0, ParticleKind::Normal, 0);
        model.add_particle([500.0, 0.0, 0.0], 100.0, ParticleKind::Normal, 0);
        builders::add_excluded_volume(&mut model, 1.0);
        model.add_restraint(Restraint::EllipticEnvelope {
            beads: vec![0, 1],
            semiaxes: [1000.0; 3],
            k: 1.0,
            scale: 100.0,
            origin: RestraintOrigin::Envelope,
        });
        model.add_restraint(Restraint::HarmonicUpperBound {
            i: 0,
            j: 1,
            dist: 2.0 * (100.0 + 100.0),
            k: 1.0,
            origin: RestraintOrigin::Polymer,
        });

        let stats = NativeKernel::default()
            .optimize(&mut model, &quiet_opts(), &run_info(1234))
            .unwrap();

        let d = model.particles[0].distance(&model.particles[1]);
        assert!(d <= 400.0 + 1.0, "bond not satisfied: {}", d);
        for p in &model.particles {
            assert!(p.norm() <= 900.0 + 1.0, "escaped the envelope: {}", p.norm());
        }
        let summary = model.evaluate(0.05);
        assert_eq!(summary.total_violated(), 0);
        assert!(stats.final_energy.is_finite());
    }

    #[test]
    fn identical_seeds_reproduce_trajectories() {
        let build = || {
            let mut m = Model::new();
            m.add_particle([0.0, 0.0, 0.0], 10.0, ParticleKind::Normal, 0);
            m.add_particle([100.0, 0.0, 0.0], 10.0, ParticleKind::Normal, 0);
            m.add_restraint(Restraint::HarmonicUpperBound {
                i: 0,
                j: 1,
                dist: 30.0,
                k: 1.0,
                origin: RestraintOrigin::Polymer,
            });
            m
        };
        let mut a = build();
        let mut b = build();
        let opts = quiet_opts();
        NativeKernel::default().optimize(&mut a, &opts, &run_info(7)).unwrap();
        NativeKernel::default().optimize(&mut b, &opts, &run_info(7)).unwrap();
        for (pa, pb) in a.particles.iter().zip(&b.particles) {
            assert_eq!(pa.pos, pb.pos);
        }
    }

    #[test]
    fn static_dummies_do_not_move() {
        let mut model = Model::new();
        model.add_particle([0.0; 3], 0.0, ParticleKind::StaticDummy, 0);
        model.add_particle([50.0, 0.0, 0.0], 10.0, ParticleKind::Normal, 0);
        model.add_restraint(Restraint::HarmonicUpperBound {
            i: 0,
            j: 1,
            dist: 10.0,
            k: 1.0,
            origin: RestraintOrigin::FishRadial,
        });
        NativeKernel::default().optimize(&mut model, &quiet_opts(), &run_info(5)).unwrap();
        assert_eq!(model.particles[0].pos, [0.0; 3]);
        assert!(model.particles[1].norm() <= 11.0);
    }

    #[test]
    fn wall_time_overrun_is_a_kernel_error() {
        let mut model = Model::new();
        for i in 0..50 {
            model.add_particle([i as f64 * 5.0, 0.0, 0.0], 10.0, ParticleKind::Normal, 0);
        }
        builders::add_excluded_volume(&mut model, 1.0);
        let opts = OptimizerOptions {
            mdsteps: u32::MAX,
            max_wall_time: 1,
            ..quiet_opts()
        };
        let err = NativeKernel::default().optimize(&mut model, &opts, &run_info(3));
        assert!(matches!(err, Err(Error::Kernel(_))));
    }
}
