//! Pipeline configuration and the refinement state threaded through stages.
//!
//! There is no process-wide state: every stage is a function of its inputs
//! plus an explicit [`RefineState`] value owned by the pipeline.

use nalgebra::Point3;

use crate::predicates::point_in_tet;
use crate::types::Step;

/// Progress callback `(step, fraction in [0, 1]) -> keep_going`.
///
/// Returning `false` requests cancellation; the refinement engine honors it
/// at pass boundaries only, returning the last known-valid mesh.
pub type ProgressCallback = Box<dyn Fn(Step, f64) -> bool + Send + Sync>;

/// A background tet mesh carrying a per-point sizing field.
///
/// Sampled during adaptive resizing to cap the local target edge length.
/// Loading one from disk is the driver's job; the pipeline only consumes
/// the in-memory form.
#[derive(Debug, Clone)]
pub struct SizingField {
    pub vertices: Vec<Point3<f64>>,
    pub tets: Vec<[u32; 4]>,
    /// Target edge length at each vertex.
    pub values: Vec<f64>,
}

impl SizingField {
    /// Interpolated sizing value at `p`, or None if `p` is outside the
    /// background mesh.
    pub fn sample(&self, p: &Point3<f64>) -> Option<f64> {
        for tet in &self.tets {
            let [a, b, c, d] = tet.map(|i| self.vertices[i as usize]);
            if point_in_tet(p, &a, &b, &c, &d) {
                let bary = barycentric(p, &a, &b, &c, &d)?;
                let v = tet
                    .iter()
                    .zip(bary.iter())
                    .map(|(&i, &w)| self.values[i as usize] * w)
                    .sum();
                return Some(v);
            }
        }
        None
    }
}

fn barycentric(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
) -> Option<[f64; 4]> {
    let vol = |p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>, p3: &Point3<f64>| {
        (p1 - p0).cross(&(p2 - p0)).dot(&(p3 - p0))
    };
    let total = vol(a, b, c, d);
    if total.abs() < f64::MIN_POSITIVE {
        return None;
    }
    Some([
        vol(p, b, c, d) / total,
        vol(a, p, c, d) / total,
        vol(a, b, p, d) / total,
        vol(a, b, c, p) / total,
    ])
}

/// User-facing configuration with the documented defaults.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Target edge length = bbox diagonal / this. Default: 20.
    pub initial_edge_len_rel: f64,
    /// Envelope tolerance = bbox diagonal / this. Default: 1000.
    pub eps_rel: f64,
    /// Explicit triangle sampling density = bbox diagonal / this.
    /// Default: derived from the envelope tolerance (`eps / sqrt(2)`).
    pub sampling_dist_rel: Option<f64>,
    /// Retry index. Raising it narrows the envelope increments so the
    /// optimization approaches the target tolerance more gradually.
    /// Default: 1.
    pub stage: u32,
    /// Multiplier shrinking the target edge length around bad-quality
    /// vertices. Default: 0.6.
    pub adaptive_scalar: f64,
    /// Optimization stops once the max tet energy drops below this.
    /// Also decides where the sizing field is resized. Default: 10.
    pub filter_energy_thres: f64,
    /// Stall threshold on the per-pass energy deltas (max and avg).
    /// Default: 0.1.
    pub delta_energy_thres: f64,
    /// Maximum number of refinement passes. Default: 80.
    pub max_num_passes: u32,
    /// Seed extra points at voxel centers before the Delaunay stage.
    /// Default: true.
    pub use_voxel_stuffing: bool,
    /// Smooth the facets covering open holes after optimization.
    /// Default: false.
    pub smooth_open_boundary: bool,
    /// Target output vertex count within 5% tolerance; None leaves the
    /// count unconstrained. Default: None.
    pub target_num_vertices: Option<usize>,
    /// Optional background sizing field capping the target edge length.
    #[cfg_attr(feature = "config", serde(skip))]
    pub background_mesh: Option<SizingField>,
    /// Progress/cancellation callback.
    #[cfg_attr(feature = "config", serde(skip))]
    pub progress: Option<ProgressCallback>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_edge_len_rel: 20.0,
            eps_rel: 1000.0,
            sampling_dist_rel: None,
            stage: 1,
            adaptive_scalar: 0.6,
            filter_energy_thres: 10.0,
            delta_energy_thres: 0.1,
            max_num_passes: 80,
            use_voxel_stuffing: true,
            smooth_open_boundary: false,
            target_num_vertices: None,
            background_mesh: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("initial_edge_len_rel", &self.initial_edge_len_rel)
            .field("eps_rel", &self.eps_rel)
            .field("sampling_dist_rel", &self.sampling_dist_rel)
            .field("stage", &self.stage)
            .field("adaptive_scalar", &self.adaptive_scalar)
            .field("filter_energy_thres", &self.filter_energy_thres)
            .field("delta_energy_thres", &self.delta_energy_thres)
            .field("max_num_passes", &self.max_num_passes)
            .field("use_voxel_stuffing", &self.use_voxel_stuffing)
            .field("smooth_open_boundary", &self.smooth_open_boundary)
            .field("target_num_vertices", &self.target_num_vertices)
            .field("has_background_mesh", &self.background_mesh.is_some())
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

impl Config {
    /// Report progress; returns false if the caller requested cancellation.
    pub(crate) fn report(&self, step: Step, fraction: f64) -> bool {
        match &self.progress {
            Some(cb) => cb(step, fraction.clamp(0.0, 1.0)),
            None => true,
        }
    }
}

/// Values derived from the input that evolve across refinement sub-stages.
#[derive(Debug, Clone)]
pub struct RefineState {
    /// Effective envelope tolerance at the current sub-stage.
    pub eps: f64,
    /// `eps * eps`, kept in sync for squared-distance tests.
    pub eps_2: f64,
    /// Target tolerance requested by the caller.
    pub eps_input: f64,
    /// Increment applied to `eps` between sub-stages.
    pub eps_delta: f64,
    /// Current sub-stage, 1-based.
    pub sub_stage: u32,
    /// Number of sub-stages (equals the configured `stage`).
    pub n_substages: u32,
    /// Triangle sampling density at the current sub-stage.
    pub sampling_dist: f64,
    /// Explicit sampling override from the config, if any.
    sampling_override: Option<f64>,
    /// Target edge length for refinement.
    pub initial_edge_len: f64,
    /// Diagonal of the input bounding box.
    pub bbox_diag: f64,
    /// Whether the preprocessed input surface is closed.
    pub is_mesh_closed: bool,
    /// Accept local operations on max energy (true) or total energy.
    pub use_energy_max: bool,
    /// Sample whole facets against the envelope (true) or vertices only.
    pub use_sampling: bool,
    /// Project smoothed surface vertices onto the one-ring plane instead of
    /// the input surface.
    pub use_onering_projection: bool,
}

impl RefineState {
    /// Derive the initial state for the given input extent.
    ///
    /// The envelope starts at `eps_input / stage` and widens by
    /// `eps_input / stage` per sub-stage, reaching `eps_input` at the last
    /// one; with the default `stage = 1` the full tolerance applies from
    /// the start.
    pub fn new(config: &Config, bbox_diag: f64, is_mesh_closed: bool) -> Self {
        let eps_input = bbox_diag / config.eps_rel;
        let n_substages = config.stage.max(1);
        let eps = eps_input / n_substages as f64;
        let sampling_override = config.sampling_dist_rel.map(|rel| bbox_diag / rel);
        let mut state = Self {
            eps,
            eps_2: eps * eps,
            eps_input,
            eps_delta: eps_input / n_substages as f64,
            sub_stage: 1,
            n_substages,
            sampling_dist: 0.0,
            sampling_override,
            initial_edge_len: bbox_diag / config.initial_edge_len_rel,
            bbox_diag,
            is_mesh_closed,
            use_energy_max: true,
            use_sampling: true,
            use_onering_projection: false,
        };
        state.update_sampling_dist();
        state
    }

    fn update_sampling_dist(&mut self) {
        self.sampling_dist = self
            .sampling_override
            .unwrap_or(self.eps / std::f64::consts::SQRT_2);
    }

    /// True once the envelope reached the target tolerance.
    #[inline]
    pub fn at_full_eps(&self) -> bool {
        self.sub_stage >= self.n_substages
    }

    /// Widen the envelope to the next sub-stage. No-op at the last one.
    pub fn advance_substage(&mut self) {
        if self.at_full_eps() {
            return;
        }
        self.sub_stage += 1;
        self.eps = (self.eps + self.eps_delta).min(self.eps_input);
        self.eps_2 = self.eps * self.eps;
        self.update_sampling_dist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.initial_edge_len_rel, 20.0);
        assert_eq!(cfg.eps_rel, 1000.0);
        assert_eq!(cfg.stage, 1);
        assert_eq!(cfg.adaptive_scalar, 0.6);
        assert_eq!(cfg.filter_energy_thres, 10.0);
        assert_eq!(cfg.delta_energy_thres, 0.1);
        assert_eq!(cfg.max_num_passes, 80);
        assert!(cfg.use_voxel_stuffing);
        assert!(!cfg.smooth_open_boundary);
        assert!(cfg.target_num_vertices.is_none());
    }

    #[test]
    fn stage_one_starts_at_full_eps() {
        let state = RefineState::new(&Config::default(), 100.0, true);
        assert_eq!(state.eps, state.eps_input);
        assert!(state.at_full_eps());
        assert!((state.eps - 0.1).abs() < 1e-12);
        assert!((state.sampling_dist - 0.1 / std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn substages_ramp_toward_eps_input() {
        let cfg = Config {
            stage: 4,
            ..Default::default()
        };
        let mut state = RefineState::new(&cfg, 100.0, true);
        assert!((state.eps - state.eps_input / 4.0).abs() < 1e-12);
        let mut last = state.eps;
        while !state.at_full_eps() {
            state.advance_substage();
            assert!(state.eps > last, "eps must grow monotonically");
            last = state.eps;
        }
        assert!((state.eps - state.eps_input).abs() < 1e-15);
        // Further advances are no-ops.
        state.advance_substage();
        assert!((state.eps - state.eps_input).abs() < 1e-15);
    }

    #[test]
    fn sizing_field_interpolates_inside_a_tet() {
        let field = SizingField {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
            ],
            tets: vec![[0, 1, 2, 3]],
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let v = field.sample(&Point3::new(0.25, 0.25, 0.25)).unwrap();
        assert!((v - 2.5).abs() < 1e-12);
        assert!(field.sample(&Point3::new(5.0, 5.0, 5.0)).is_none());
    }
}
