//! Chromoplex configuration - typed schema over the JSON configuration file.
//!
//! The original pipeline carried a dynamic dotted-path dictionary; here every
//! section is a typed struct validated once at startup. Mutable state that
//! the steps thread through the run (current sigmas, iteration counters,
//! artifact locations) lives in the [`RuntimeState`] sub-struct, which is
//! snapshotted into the step log and restored on resume.

mod model;
mod runtime;

pub use model::*;
pub use runtime::*;

use std::path::{Path, PathBuf};

use chromoplex_common::{Error, Result};

impl Config {
    /// Load a configuration file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut cfg: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        let base = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        cfg.anchor_paths(&base);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Make relative paths absolute with respect to the working directory.
    fn anchor_paths(&mut self, base: &Path) {
        let workdir = if self.parameters.workdir.is_absolute() {
            self.parameters.workdir.clone()
        } else {
            base.join(&self.parameters.workdir)
        };
        self.parameters.workdir = workdir.clone();

        let anchor = |p: &mut PathBuf| {
            if !p.as_os_str().is_empty() && !p.is_absolute() {
                let joined = workdir.join(p.as_path());
                *p = joined;
            }
        };
        anchor(&mut self.parameters.tmp_dir);
        anchor(&mut self.parameters.step_db);
        anchor(&mut self.optimization.structure_output);
        anchor(&mut self.optimization.tmp_dir);
        if let Some(hic) = self.restraints.hic.as_mut() {
            anchor(&mut hic.input_matrix);
            anchor(&mut hic.tmp_dir);
        }
        if let Some(damid) = self.restraints.damid.as_mut() {
            anchor(&mut damid.input_profile);
            anchor(&mut damid.tmp_dir);
        }
        if let Some(sprite) = self.restraints.sprite.as_mut() {
            anchor(&mut sprite.clusters);
            anchor(&mut sprite.tmp_dir);
            anchor(&mut sprite.assignment_file);
        }
        if let Some(fish) = self.restraints.fish.as_mut() {
            anchor(&mut fish.input_fish);
            anchor(&mut fish.tmp_dir);
        }
        if let EnvelopeShape::ExpMap = self.model.restraints.envelope.nucleus_shape {
            if let Some(map) = self.model.restraints.envelope.input_map.as_mut() {
                anchor(map);
            }
        }
    }

    /// Schema validation, run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.model.population_size == 0 {
            return Err(Error::Config("model.population_size must be positive".into()));
        }
        let env = &self.model.restraints.envelope;
        match env.nucleus_shape {
            EnvelopeShape::Sphere => {
                if env.nucleus_radius <= 0.0 {
                    return Err(Error::Config("envelope.nucleus_radius must be positive".into()));
                }
            }
            EnvelopeShape::Ellipsoid => {
                if env.nucleus_semiaxes.iter().any(|&a| a <= 0.0) {
                    return Err(Error::Config(
                        "envelope.nucleus_semiaxes must all be positive".into(),
                    ));
                }
            }
            EnvelopeShape::ExpMap => {
                let map = env.input_map.as_ref().ok_or_else(|| {
                    Error::Config("envelope.input_map required for exp_map shape".into())
                })?;
                if !map.is_file() {
                    return Err(Error::Config(format!(
                        "envelope map {} does not exist",
                        map.display()
                    )));
                }
            }
        }
        if let Some(hic) = &self.restraints.hic {
            if !hic.input_matrix.is_file() {
                return Err(Error::Config(format!(
                    "Hi-C input matrix {} does not exist",
                    hic.input_matrix.display()
                )));
            }
            check_sigma_list("restraints.hic.intra_sigma_list", &hic.intra_sigma_list)?;
            check_sigma_list("restraints.hic.inter_sigma_list", &hic.inter_sigma_list)?;
            if hic.intra_sigma_list.len() != hic.inter_sigma_list.len() {
                return Err(Error::Config(
                    "Hi-C intra and inter sigma lists must have equal length".into(),
                ));
            }
        }
        if let Some(damid) = &self.restraints.damid {
            if !damid.input_profile.is_file() {
                return Err(Error::Config(format!(
                    "DamID input profile {} does not exist",
                    damid.input_profile.display()
                )));
            }
            check_sigma_list("restraints.damid.sigma_list", &damid.sigma_list)?;
        }
        if let Some(sprite) = &self.restraints.sprite {
            if !sprite.clusters.is_file() {
                return Err(Error::Config(format!(
                    "SPRITE clusters file {} does not exist",
                    sprite.clusters.display()
                )));
            }
            if !(0.0 < sprite.volume_fraction && sprite.volume_fraction <= 1.0) {
                return Err(Error::Config("sprite.volume_fraction must be in (0, 1]".into()));
            }
            if sprite.keep_best == 0 {
                return Err(Error::Config("sprite.keep_best must be positive".into()));
            }
        }
        if let Some(fish) = &self.restraints.fish {
            if !fish.input_fish.is_file() {
                return Err(Error::Config(format!(
                    "FISH input file {} does not exist",
                    fish.input_fish.display()
                )));
            }
            if fish.tol_list.is_empty() {
                return Err(Error::Config("fish.tol_list must not be empty".into()));
            }
            for w in fish.tol_list.windows(2) {
                if w[1] > w[0] {
                    return Err(Error::Config("fish.tol_list must be non-increasing".into()));
                }
            }
        }
        if self.optimization.kernel.is_empty() {
            return Err(Error::Config("optimization.kernel must be set".into()));
        }
        Ok(())
    }

    /// Content hash of the static configuration (everything but `runtime`).
    ///
    /// Folded into step uids so that resuming against an edited
    /// configuration re-runs the steps instead of replaying stale records.
    pub fn static_hash(&self) -> String {
        let mut probe = self.clone();
        probe.runtime = RuntimeState::default();
        let bytes = serde_json::to_vec(&probe).expect("config is always serializable");
        blake3::hash(&bytes).to_hex()[..16].to_string()
    }

    /// Directory for step-scoped temporary files, created on demand.
    pub fn step_tmp_dir(&self) -> &Path {
        &self.parameters.tmp_dir
    }
}

fn check_sigma_list(key: &str, list: &[f64]) -> Result<()> {
    if list.is_empty() {
        return Err(Error::Config(format!("{} must not be empty", key)));
    }
    for &s in list {
        if !(0.0..=1.0).contains(&s) {
            return Err(Error::Config(format!("{} entries must be in [0, 1]", key)));
        }
    }
    for w in list.windows(2) {
        if w[1] > w[0] {
            return Err(Error::Config(format!("{} must be non-increasing", key)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(dir: &Path) -> String {
        format!(
            r#"{{
                "model": {{ "population_size": 2 }},
                "optimization": {{ "structure_output": "pop.cps" }},
                "parameters": {{ "workdir": "{}" }}
            }}"#,
            dir.display()
        )
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("igm.json");
        std::fs::write(&path, minimal_json(dir.path())).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.model.population_size, 2);
        assert_eq!(cfg.model.restraints.polymer.contact_range, 2.0);
        assert!(matches!(
            cfg.model.restraints.envelope.nucleus_shape,
            EnvelopeShape::Sphere
        ));
        assert!(cfg.optimization.structure_output.is_absolute());
        assert!(cfg.restraints.hic.is_none());
    }

    #[test]
    fn increasing_sigma_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let matrix = dir.path().join("m.cpxd");
        std::fs::write(&matrix, b"x").unwrap();
        let json = format!(
            r#"{{
                "model": {{ "population_size": 2 }},
                "restraints": {{ "hic": {{
                    "input_matrix": "{}",
                    "intra_sigma_list": [0.1, 0.5],
                    "inter_sigma_list": [0.1, 0.5]
                }} }},
                "optimization": {{ "structure_output": "pop.cps" }},
                "parameters": {{ "workdir": "{}" }}
            }}"#,
            matrix.display(),
            dir.path().display()
        );
        let path = dir.path().join("igm.json");
        std::fs::write(&path, json).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn static_hash_ignores_runtime_but_not_static_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("igm.json");
        std::fs::write(&path, minimal_json(dir.path())).unwrap();

        let mut cfg = Config::load(&path).unwrap();
        let h0 = cfg.static_hash();
        cfg.runtime.opt_iter = 7;
        assert_eq!(cfg.static_hash(), h0);
        cfg.model.population_size = 3;
        assert_ne!(cfg.static_hash(), h0);
    }
}
