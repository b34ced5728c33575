//! Iterative mesh refinement: edge split, edge collapse, edge/face swap and
//! vertex smoothing, scheduled by the AMIPS energy.
//!
//! Every accepted operation keeps the global invariants: positive tet
//! volumes (checked with exact predicates), surface facets inside the
//! envelope at the current tolerance, consistent vertex/tet incidence, and
//! no duplicated vertex positions. Rejected operations leave the mesh
//! untouched.

use hashbrown::{HashMap, HashSet};
use nalgebra::Point3;
use tracing::{debug, info};

use crate::envelope::Envelope;
use crate::error::{TetError, TetResult};
use crate::predicates::{orient3d_rational, Orientation};
use crate::quality::{self, Energy, TetQuality};
use crate::state::{Config, RefineState};
use crate::tetra::orient_exact;
use crate::types::{FacetTag, RationalPoint, Step, TetMesh, TetVertex, Triangle, TET_EDGES, TET_FACETS};

/// What the refinement loop ended on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefineOutcome {
    pub passes: u32,
    /// Pass budget ran out before the energy threshold was reached.
    pub pass_limit_exceeded: bool,
    /// The caller cancelled through the progress callback.
    pub cancelled: bool,
    pub max_energy: f64,
    pub avg_energy: f64,
}

/// Run the refinement passes over the mesh.
pub fn refine(
    mesh: &mut TetMesh,
    envelope: &Envelope,
    state: &mut RefineState,
    config: &Config,
) -> TetResult<RefineOutcome> {
    let mut refiner = Refiner {
        scales: vec![1.0; mesh.vertices.len()],
        mesh,
        envelope,
        config,
    };
    let mut outcome = RefineOutcome::default();
    let mut last = quality::compute_all(refiner.mesh);
    let mut converged = false;

    for pass in 0..config.max_num_passes {
        if !config.report(Step::Optimize, pass as f64 / config.max_num_passes as f64) {
            outcome.cancelled = true;
            break;
        }
        let nv = refiner.mesh.active_vertex_count();
        let (lo, hi) = match config.target_num_vertices {
            Some(t) => ((t as f64 * 0.95) as usize, (t as f64 * 1.05) as usize),
            None => (0, usize::MAX),
        };
        let splits = if nv <= hi { refiner.split_pass(state) } else { 0 };
        let collapses = if nv >= lo { refiner.collapse_pass(state) } else { 0 };
        let swaps = refiner.swap_pass(state);
        let smooths = refiner.smooth_pass(state);

        let stats = quality::compute_all(refiner.mesh);
        outcome.passes = pass + 1;
        debug!(
            "pass {pass}: {splits} splits, {collapses} collapses, {swaps} swaps, {smooths} smooths; max E = {:.4}, avg E = {:.4}, {} inverted, eps = {:.6}",
            stats.max, stats.avg, stats.n_inverted, state.eps
        );

        if stats.max < config.filter_energy_thres && state.at_full_eps() {
            converged = true;
            outcome.max_energy = stats.max;
            outcome.avg_energy = stats.avg;
            break;
        }
        let stalled = (last.max - stats.max) < config.delta_energy_thres
            && (last.avg - stats.avg) < config.delta_energy_thres;
        if !state.at_full_eps() {
            state.advance_substage();
        } else if stalled {
            let resized = refiner.update_scales(config.filter_energy_thres, config.adaptive_scalar);
            debug!("stalled pass: resized target length at {resized} vertices");
        }
        last = stats;
        outcome.max_energy = stats.max;
        outcome.avg_energy = stats.avg;
    }
    outcome.pass_limit_exceeded = !converged && !outcome.cancelled;

    refiner.round_vertices();
    if config.smooth_open_boundary && !state.is_mesh_closed {
        let n = refiner.smooth_boundary_pass(state);
        debug!("open-boundary smoothing moved {n} vertices");
        quality::compute_all(refiner.mesh);
    }

    // Surface facets were only ever accepted inside the (monotone) envelope,
    // so a violation here means the tolerance cannot be honored at all.
    let eps_2 = state.eps_input * state.eps_input;
    for t in refiner.mesh.active_tets() {
        for f in 0..4 {
            if !refiner.mesh.facet_tags[t][f].is_surface() {
                continue;
            }
            let tri = refiner.facet_triangle(t, f);
            if !envelope.triangle_inside(&tri, eps_2, state.sampling_dist) {
                return Err(TetError::EnvelopeInfeasible { eps: state.eps_input });
            }
        }
    }
    if converged {
        info!(
            "refinement converged after {} passes, max energy {:.4}",
            outcome.passes, outcome.max_energy
        );
    }
    Ok(outcome)
}

struct Refiner<'a> {
    mesh: &'a mut TetMesh,
    envelope: &'a Envelope,
    config: &'a Config,
    /// Per-vertex multiplier on the target edge length.
    scales: Vec<f64>,
}

impl<'a> Refiner<'a> {
    fn facet_triangle(&self, t: usize, f: usize) -> Triangle {
        let [a, b, c] = self.mesh.facet(t, f);
        Triangle::new(
            self.mesh.vertices[a as usize].posf,
            self.mesh.vertices[b as usize].posf,
            self.mesh.vertices[c as usize].posf,
        )
    }

    /// Envelope test for a surface facet at the current tolerance: full
    /// stratified sampling, or corner-only when sampling is disabled.
    fn facet_in_envelope(&self, tri: &Triangle, state: &RefineState) -> bool {
        if state.use_sampling {
            self.envelope
                .triangle_inside(tri, state.eps_2, state.sampling_dist)
        } else {
            [tri.v0, tri.v1, tri.v2]
                .iter()
                .all(|p| self.envelope.point_inside(p, state.eps_2))
        }
    }

    /// Target edge length around the edge `(u, v)`.
    fn target_len(&self, u: u32, v: u32, state: &RefineState) -> f64 {
        let scale = (self.scales[u as usize] + self.scales[v as usize]) / 2.0;
        let mut target = state.initial_edge_len * scale;
        if let Some(bg) = &self.config.background_mesh {
            let pu = self.mesh.vertices[u as usize].posf;
            let pv = self.mesh.vertices[v as usize].posf;
            let mid = Point3::new(
                (pu.x + pv.x) / 2.0,
                (pu.y + pv.y) / 2.0,
                (pu.z + pv.z) / 2.0,
            );
            if let Some(cap) = bg.sample(&mid) {
                target = target.min(cap);
            }
        }
        target
    }

    fn edge_len(&self, u: u32, v: u32) -> f64 {
        (self.mesh.vertices[u as usize].posf - self.mesh.vertices[v as usize].posf).norm()
    }

    /// Unique edges of the live tets.
    fn edges(&self) -> Vec<(u32, u32)> {
        let mut set: HashSet<(u32, u32)> = HashSet::new();
        for t in self.mesh.active_tets() {
            let tet = self.mesh.tets[t];
            for [i, j] in TET_EDGES {
                let a = tet[i];
                let b = tet[j];
                set.insert(if a < b { (a, b) } else { (b, a) });
            }
        }
        set.into_iter().collect()
    }

    /// Live tets containing both endpoints.
    fn incident_tets(&self, u: u32, v: u32) -> Vec<usize> {
        self.mesh.vertices[u as usize]
            .conn_tets
            .intersection(&self.mesh.vertices[v as usize].conn_tets)
            .map(|&t| t as usize)
            .collect()
    }

    /// Surface facets (tet, slot) containing both endpoints.
    fn surface_facets_on_edge(&self, u: u32, v: u32) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for &t in &self.incident_tets(u, v) {
            for f in 0..4 {
                if !self.mesh.facet_tags[t][f].is_surface() {
                    continue;
                }
                let facet = self.mesh.facet(t, f);
                if facet.contains(&u) && facet.contains(&v) {
                    out.push((t, f));
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // SPLIT
    // ------------------------------------------------------------------

    /// Split edges longer than 4/3 of their target length, longest first.
    fn split_pass(&mut self, state: &RefineState) -> usize {
        let mut candidates: Vec<((u32, u32), f64)> = self
            .edges()
            .into_iter()
            .filter_map(|(u, v)| {
                let len = self.edge_len(u, v);
                (len > self.target_len(u, v, state) * (4.0 / 3.0)).then_some(((u, v), len))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut count = 0;
        for ((u, v), _) in candidates {
            if self.try_split(u, v, state) {
                count += 1;
            }
        }
        count
    }

    fn try_split(&mut self, u: u32, v: u32, state: &RefineState) -> bool {
        let incident = self.incident_tets(u, v);
        if incident.is_empty() {
            return false;
        }

        // Midpoint; exact when an endpoint is unrounded.
        let half = num_rational::BigRational::new(1.into(), 2.into());
        let mid_vertex = if self.mesh.vertices[u as usize].is_rounded()
            && self.mesh.vertices[v as usize].is_rounded()
        {
            let pu = self.mesh.vertices[u as usize].posf;
            let pv = self.mesh.vertices[v as usize].posf;
            TetVertex::new(Point3::new(
                (pu.x + pv.x) / 2.0,
                (pu.y + pv.y) / 2.0,
                (pu.z + pv.z) / 2.0,
            ))
        } else {
            let pu = self.mesh.vertices[u as usize].exact();
            let pv = self.mesh.vertices[v as usize].exact();
            TetVertex::from_rational(RationalPoint([
                (&pu.0[0] + &pv.0[0]) * &half,
                (&pu.0[1] + &pv.0[1]) * &half,
                (&pu.0[2] + &pv.0[2]) * &half,
            ]))
        };

        let surface_facets = self.surface_facets_on_edge(u, v);
        let on_surface = !surface_facets.is_empty();

        let m = self.mesh.vertices.len() as u32;
        self.mesh.vertices.push(mid_vertex);

        // Envelope: both halves of every split surface facet must stay in.
        if on_surface {
            for &(t, f) in &surface_facets {
                let facet = self.mesh.facet(t, f);
                let w = *facet.iter().find(|&&x| x != u && x != v).expect("third corner");
                for kept in [u, v] {
                    let tri = Triangle::new(
                        self.mesh.vertices[kept as usize].posf,
                        self.mesh.vertices[m as usize].posf,
                        self.mesh.vertices[w as usize].posf,
                    );
                    if !self.facet_in_envelope(&tri, state) {
                        self.mesh.vertices.pop();
                        return false;
                    }
                }
            }
        }

        // Geometry: all child tets positive, max energy not above the old.
        let mut old_max = Energy::Finite(0.0);
        for &t in &incident {
            old_max = old_max.max(self.mesh.qualities[t].slim_energy);
        }
        let mut children: Vec<([u32; 4], [FacetTag; 4], TetQuality)> = Vec::new();
        for &t in &incident {
            let tet = self.mesh.tets[t];
            let pos_u = tet.iter().position(|&x| x == u).expect("u in tet");
            let pos_v = tet.iter().position(|&x| x == v).expect("v in tet");
            for (replaced_slot, _kept) in [(pos_v, u), (pos_u, v)] {
                let mut child = tet;
                child[replaced_slot] = m;
                if orient_exact(&self.mesh.vertices, child[0], child[1], child[2], child[3])
                    != Orientation::Positive
                {
                    self.mesh.vertices.pop();
                    return false;
                }
                let q = self.candidate_quality(child);
                let mut tags = self.mesh.facet_tags[t];
                // The facet opposite the surviving endpoint separates the
                // two children and is interior.
                let sep_slot = if replaced_slot == pos_v { pos_u } else { pos_v };
                tags[sep_slot] = FacetTag::NotSurface;
                children.push((child, tags, q));
            }
        }
        let new_max = children
            .iter()
            .fold(Energy::Finite(0.0), |acc, (_, _, q)| acc.max(q.slim_energy));
        if !new_max.is_not_worse_than(old_max) {
            self.mesh.vertices.pop();
            return false;
        }

        // Apply.
        let vu = &self.mesh.vertices[u as usize];
        let vv = &self.mesh.vertices[v as usize];
        let on_bbox = vu.on_bbox && vv.on_bbox && self.edge_has_tag(u, v, &incident, FacetTag::Bbox);
        let on_boundary =
            vu.on_boundary && vv.on_boundary && self.edge_has_tag(u, v, &incident, FacetTag::Boundary);
        {
            let mv = self.mesh.vertices.last_mut().expect("midpoint");
            mv.on_surface = on_surface;
            mv.on_bbox = on_bbox;
            mv.on_boundary = on_boundary;
        }
        self.scales.push(
            (self.scales[u as usize] + self.scales[v as usize]) / 2.0,
        );
        for &t in &incident {
            self.mesh.remove_tet(t);
        }
        for (child, tags, q) in children {
            let id = self.mesh.push_tet(child, tags);
            self.mesh.qualities[id] = q;
        }
        true
    }

    fn edge_has_tag(&self, u: u32, v: u32, incident: &[usize], tag: FacetTag) -> bool {
        incident.iter().any(|&t| {
            (0..4).any(|f| {
                self.mesh.facet_tags[t][f] == tag && {
                    let facet = self.mesh.facet(t, f);
                    facet.contains(&u) && facet.contains(&v)
                }
            })
        })
    }

    fn candidate_quality(&self, tet: [u32; 4]) -> TetQuality {
        let [a, b, c, d] = tet.map(|x| self.mesh.vertices[x as usize].posf);
        TetQuality::compute(&a, &b, &c, &d)
    }

    // ------------------------------------------------------------------
    // COLLAPSE
    // ------------------------------------------------------------------

    /// Collapse edges shorter than 4/5 of their target length, shortest
    /// first.
    fn collapse_pass(&mut self, state: &RefineState) -> usize {
        let mut candidates: Vec<((u32, u32), f64)> = self
            .edges()
            .into_iter()
            .filter_map(|(u, v)| {
                let len = self.edge_len(u, v);
                (len < self.target_len(u, v, state) * 0.8).then_some(((u, v), len))
            })
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut count = 0;
        for ((u, v), _) in candidates {
            if self.try_collapse(u, v, state) || self.try_collapse(v, u, state) {
                count += 1;
            }
        }
        count
    }

    /// Collapse `u` onto `v`.
    fn try_collapse(&mut self, u: u32, v: u32, state: &RefineState) -> bool {
        let vu = &self.mesh.vertices[u as usize];
        let vv = &self.mesh.vertices[v as usize];
        if vu.conn_tets.is_empty() || vv.conn_tets.is_empty() {
            return false;
        }
        // The bounding box may not deform, and the tracked surface and hole
        // rims may only slide along themselves.
        if vu.on_bbox {
            return false;
        }
        if vu.on_surface && !vv.on_surface {
            return false;
        }
        if vu.on_boundary && !vv.on_boundary {
            return false;
        }

        let removing = self.incident_tets(u, v);
        if removing.is_empty() {
            return false;
        }
        let affected: Vec<usize> = vu
            .conn_tets
            .iter()
            .map(|&t| t as usize)
            .filter(|t| !removing.contains(t))
            .collect();

        // Remapped tets must stay positive; energy must not get worse.
        let mut old_max = Energy::Finite(0.0);
        let mut old_total = 0.0;
        for &t in self.mesh.vertices[u as usize].conn_tets.iter() {
            let e = self.mesh.qualities[t as usize].slim_energy;
            old_max = old_max.max(e);
            old_total += e.capped();
        }
        let mut new_qualities: Vec<(usize, TetQuality)> = Vec::new();
        let mut new_max = Energy::Finite(0.0);
        let mut new_total = 0.0;
        for &t in &affected {
            let mapped = self.mesh.tets[t].map(|x| if x == u { v } else { x });
            if orient_exact(&self.mesh.vertices, mapped[0], mapped[1], mapped[2], mapped[3])
                != Orientation::Positive
            {
                return false;
            }
            let q = self.candidate_quality(mapped);
            new_max = new_max.max(q.slim_energy);
            new_total += q.slim_energy.capped();
            new_qualities.push((t, q));
        }
        let acceptable = if state.use_energy_max {
            new_max.is_not_worse_than(old_max)
        } else {
            new_total < old_total
        };
        if !acceptable {
            return false;
        }

        // Envelope: the image of every surface facet riding on `u` must
        // stay inside.
        for &t in &affected {
            for f in 0..4 {
                if !self.mesh.facet_tags[t][f].is_surface() {
                    continue;
                }
                let facet = self.mesh.facet(t, f);
                if !facet.contains(&u) {
                    continue;
                }
                let tri_pts = facet.map(|x| {
                    let y = if x == u { v } else { x };
                    self.mesh.vertices[y as usize].posf
                });
                let tri = Triangle::new(tri_pts[0], tri_pts[1], tri_pts[2]);
                if !self.facet_in_envelope(&tri, state) {
                    return false;
                }
            }
        }

        // Surviving mirror facets of the removed tets inherit their tags.
        // A tag coming from the facet through `u` tags a facet that moved,
        // so its image must also pass the envelope test.
        let mut migrations: Vec<([u32; 3], FacetTag)> = Vec::new();
        for &t in &removing {
            let tet = self.mesh.tets[t];
            let pos_u = tet.iter().position(|&x| x == u).expect("u");
            let pos_v = tet.iter().position(|&x| x == v).expect("v");
            let tag = pick_tag(self.mesh.facet_tags[t][pos_u], self.mesh.facet_tags[t][pos_v]);
            if tag == FacetTag::NotSurface {
                continue;
            }
            let mut rest: Vec<u32> = tet.iter().copied().filter(|&x| x != u && x != v).collect();
            rest.push(v);
            let tri = [rest[0], rest[1], rest[2]];
            if tag.is_surface() && self.mesh.facet_tags[t][pos_v].is_surface() {
                let pts = tri.map(|x| self.mesh.vertices[x as usize].posf);
                let image = Triangle::new(pts[0], pts[1], pts[2]);
                if !self.facet_in_envelope(&image, state) {
                    return false;
                }
            }
            migrations.push((tri, tag));
        }

        // Apply.
        for &t in &removing {
            self.mesh.remove_tet(t);
        }
        for &t in &affected {
            for x in self.mesh.tets[t].iter_mut() {
                if *x == u {
                    *x = v;
                }
            }
            self.mesh.vertices[v as usize].conn_tets.insert(t as u32);
        }
        self.mesh.vertices[u as usize].conn_tets.clear();
        for (t, q) in new_qualities {
            self.mesh.qualities[t] = q;
        }
        for (tri, tag) in migrations {
            self.set_facet_tag(tri, tag);
        }
        true
    }

    /// Tag the facet `{a, b, c}` in every live tet containing it.
    fn set_facet_tag(&mut self, tri: [u32; 3], tag: FacetTag) {
        let tets: Vec<usize> = self.mesh.vertices[tri[0] as usize]
            .conn_tets
            .iter()
            .filter(|&&t| {
                let tet = self.mesh.tets[t as usize];
                tri.iter().all(|v| tet.contains(v))
            })
            .map(|&t| t as usize)
            .collect();
        for t in tets {
            let tet = self.mesh.tets[t];
            let slot = tet
                .iter()
                .position(|v| !tri.contains(v))
                .expect("facet slot");
            self.mesh.facet_tags[t][slot] = tag;
            if tag.is_surface() {
                for v in tri {
                    self.mesh.vertices[v as usize].on_surface = true;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // SWAP
    // ------------------------------------------------------------------

    /// Edge swaps (3-2 and 4-4) and face swaps (2-3) that strictly lower
    /// the local maximum energy. Tagged edges/facets are left alone so the
    /// tracked surface never moves.
    fn swap_pass(&mut self, state: &RefineState) -> usize {
        let mut count = 0;
        for (u, v) in self.edges() {
            let incident = self.incident_tets(u, v);
            match incident.len() {
                3 => {
                    if self.try_swap_32(u, v, &incident) {
                        count += 1;
                    }
                }
                4 => {
                    if self.try_swap_44(u, v, &incident) {
                        count += 1;
                    }
                }
                _ => {}
            }
        }
        count += self.face_swap_pass(state);
        count
    }

    fn edge_is_tagged(&self, u: u32, v: u32, incident: &[usize]) -> bool {
        incident.iter().any(|&t| {
            (0..4).any(|f| {
                self.mesh.facet_tags[t][f] != FacetTag::NotSurface && {
                    let facet = self.mesh.facet(t, f);
                    facet.contains(&u) && facet.contains(&v)
                }
            })
        })
    }

    /// Ring vertices around an interior edge, or None when the star is not
    /// a closed fan.
    fn edge_ring(&self, u: u32, v: u32, incident: &[usize]) -> Option<Vec<u32>> {
        // Each incident tet contributes one ring pair.
        let mut pairs: Vec<(u32, u32)> = Vec::new();
        for &t in incident {
            let rest: Vec<u32> = self.mesh.tets[t]
                .iter()
                .copied()
                .filter(|&x| x != u && x != v)
                .collect();
            if rest.len() != 2 {
                return None;
            }
            pairs.push((rest[0], rest[1]));
        }
        // Chain the pairs into a cycle.
        let mut ring = vec![pairs[0].0, pairs[0].1];
        let mut used = vec![false; pairs.len()];
        used[0] = true;
        for _ in 1..pairs.len() {
            let tail = *ring.last().expect("ring");
            let next = pairs.iter().enumerate().find(|(i, p)| {
                !used[*i] && (p.0 == tail || p.1 == tail)
            })?;
            let (i, &(a, b)) = next;
            used[i] = true;
            ring.push(if a == tail { b } else { a });
        }
        // Closed cycle: last pair returns to the start.
        if ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() != incident.len() {
            return None;
        }
        Some(ring)
    }

    fn old_max_energy(&self, tets: &[usize]) -> Energy {
        tets.iter().fold(Energy::Finite(0.0), |acc, &t| {
            acc.max(self.mesh.qualities[t].slim_energy)
        })
    }

    /// Collect the non-interior facet tags of a set of tets, keyed by the
    /// sorted facet triple.
    fn tag_lookup(&self, tets: &[usize]) -> HashMap<[u32; 3], FacetTag> {
        let mut map = HashMap::new();
        for &t in tets {
            for f in 0..4 {
                let tag = self.mesh.facet_tags[t][f];
                if tag != FacetTag::NotSurface {
                    let mut key = self.mesh.facet(t, f);
                    key.sort_unstable();
                    map.insert(key, tag);
                }
            }
        }
        map
    }

    /// Replace the tets with new ones, restoring outer facet tags.
    fn apply_swap(
        &mut self,
        old: &[usize],
        new: Vec<([u32; 4], TetQuality)>,
        tags: &HashMap<[u32; 3], FacetTag>,
    ) {
        for &t in old {
            self.mesh.remove_tet(t);
        }
        for (tet, q) in new {
            let mut facet_tags = [FacetTag::NotSurface; 4];
            for (f, facet) in TET_FACETS.iter().enumerate() {
                let mut key = [tet[facet[0]], tet[facet[1]], tet[facet[2]]];
                key.sort_unstable();
                if let Some(&tag) = tags.get(&key) {
                    facet_tags[f] = tag;
                }
            }
            let id = self.mesh.push_tet(tet, facet_tags);
            self.mesh.qualities[id] = q;
        }
    }

    /// New tet for an apex known to see `(a, b, c)` from the given side.
    fn apex_tet(&self, a: u32, b: u32, c: u32, apex: u32, side: Orientation) -> ([u32; 4], TetQuality) {
        let tet = if side == Orientation::Positive {
            [a, b, c, apex]
        } else {
            [a, c, b, apex]
        };
        (tet, self.candidate_quality(tet))
    }

    fn try_swap_32(&mut self, u: u32, v: u32, incident: &[usize]) -> bool {
        if self.edge_is_tagged(u, v, incident) {
            return false;
        }
        let Some(ring) = self.edge_ring(u, v, incident) else {
            return false;
        };
        let [w0, w1, w2] = [ring[0], ring[1], ring[2]];
        // The ring triangle must separate the edge endpoints, otherwise
        // the two replacement tets would overlap instead of tiling the
        // old star.
        let s_u = orient_exact(&self.mesh.vertices, w0, w1, w2, u);
        let s_v = orient_exact(&self.mesh.vertices, w0, w1, w2, v);
        if s_u == Orientation::Zero || s_v == Orientation::Zero || s_u == s_v {
            return false;
        }
        let top = self.apex_tet(w0, w1, w2, u, s_u);
        let bottom = self.apex_tet(w0, w1, w2, v, s_v);
        let new_max = top.1.slim_energy.max(bottom.1.slim_energy);
        if !new_max.is_better_than(self.old_max_energy(incident)) {
            return false;
        }
        let tags = self.tag_lookup(incident);
        self.apply_swap(incident, vec![top, bottom], &tags);
        true
    }

    fn try_swap_44(&mut self, u: u32, v: u32, incident: &[usize]) -> bool {
        if self.edge_is_tagged(u, v, incident) {
            return false;
        }
        let Some(ring) = self.edge_ring(u, v, incident) else {
            return false;
        };
        let old_max = self.old_max_energy(incident);
        // Two ways to split the ring quad; take the better valid one.
        let mut best: Option<(Vec<([u32; 4], TetQuality)>, Energy)> = None;
        for (a, b, c, d) in [
            (ring[0], ring[1], ring[2], ring[3]),
            (ring[1], ring[2], ring[3], ring[0]),
        ] {
            // Diagonal (a, c): each apex must see both halves of the quad
            // from one consistent side, and the apexes from opposite sides.
            let s1 = orient_exact(&self.mesh.vertices, a, b, c, u);
            let s2 = orient_exact(&self.mesh.vertices, a, c, d, u);
            let s3 = orient_exact(&self.mesh.vertices, a, b, c, v);
            let s4 = orient_exact(&self.mesh.vertices, a, c, d, v);
            if s1 == Orientation::Zero || s2 == Orientation::Zero || s1 != s2 {
                continue;
            }
            if s3 == Orientation::Zero || s4 == Orientation::Zero || s3 != s4 || s3 == s1 {
                continue;
            }
            let parts = vec![
                self.apex_tet(a, b, c, u, s1),
                self.apex_tet(a, c, d, u, s2),
                self.apex_tet(a, b, c, v, s3),
                self.apex_tet(a, c, d, v, s4),
            ];
            let max = parts
                .iter()
                .fold(Energy::Finite(0.0), |acc, (_, q)| acc.max(q.slim_energy));
            if max.is_better_than(old_max)
                && best.as_ref().map_or(true, |(_, e)| max.is_better_than(*e))
            {
                best = Some((parts, max));
            }
        }
        let Some((parts, _)) = best else {
            return false;
        };
        let tags = self.tag_lookup(incident);
        self.apply_swap(incident, parts, &tags);
        true
    }

    /// 2-3 swaps over untagged interior facets.
    fn face_swap_pass(&mut self, _state: &RefineState) -> usize {
        let mut facets: HashMap<[u32; 3], Vec<usize>> = HashMap::new();
        for t in self.mesh.active_tets() {
            for f in 0..4 {
                let mut key = self.mesh.facet(t, f);
                key.sort_unstable();
                facets.entry(key).or_default().push(t);
            }
        }
        let mut count = 0;
        for (key, tets) in facets {
            if tets.len() != 2 {
                continue;
            }
            let (t0, t1) = (tets[0], tets[1]);
            if self.mesh.removed[t0] || self.mesh.removed[t1] {
                continue;
            }
            // Either side tagged: leave the facet alone.
            let tagged = [t0, t1].iter().any(|&t| {
                (0..4).any(|f| {
                    let mut k = self.mesh.facet(t, f);
                    k.sort_unstable();
                    k == key && self.mesh.facet_tags[t][f] != FacetTag::NotSurface
                })
            });
            if tagged {
                continue;
            }
            let d = self.mesh.tets[t0]
                .iter()
                .copied()
                .find(|x| !key.contains(x))
                .expect("apex");
            let e = self.mesh.tets[t1]
                .iter()
                .copied()
                .find(|x| !key.contains(x))
                .expect("apex");
            if d == e {
                continue;
            }
            let old = [t0, t1];
            let old_max = self.old_max_energy(&old);
            // The new edge (d, e) must pierce the shared facet: all three
            // wedge orientations agree in sign.
            let signs = [
                orient_exact(&self.mesh.vertices, key[0], key[1], d, e),
                orient_exact(&self.mesh.vertices, key[1], key[2], d, e),
                orient_exact(&self.mesh.vertices, key[2], key[0], d, e),
            ];
            if signs.contains(&Orientation::Zero) || signs[0] != signs[1] || signs[1] != signs[2] {
                continue;
            }
            let parts: Vec<([u32; 4], TetQuality)> = [(0, 1), (1, 2), (2, 0)]
                .into_iter()
                .map(|(i, j)| {
                    let tet = if signs[0] == Orientation::Positive {
                        [key[i], key[j], d, e]
                    } else {
                        [key[j], key[i], d, e]
                    };
                    (tet, self.candidate_quality(tet))
                })
                .collect();
            let new_max = parts
                .iter()
                .fold(Energy::Finite(0.0), |acc, (_, q)| acc.max(q.slim_energy));
            if !new_max.is_better_than(old_max) {
                continue;
            }
            let tags = self.tag_lookup(&old);
            self.apply_swap(&old, parts, &tags);
            count += 1;
        }
        count
    }

    // ------------------------------------------------------------------
    // SMOOTH
    // ------------------------------------------------------------------

    /// Laplacian-toward-centroid smoothing with a shrinking line search.
    fn smooth_pass(&mut self, state: &RefineState) -> usize {
        let mut count = 0;
        for v in 0..self.mesh.vertices.len() as u32 {
            if self.try_smooth(v, state, false) {
                count += 1;
            }
        }
        count
    }

    /// Post-pass for open inputs: relax the hole-cover vertices.
    fn smooth_boundary_pass(&mut self, state: &RefineState) -> usize {
        let mut count = 0;
        for v in 0..self.mesh.vertices.len() as u32 {
            if self.mesh.vertices[v as usize].on_boundary && self.try_smooth(v, state, true) {
                count += 1;
            }
        }
        count
    }

    fn one_ring(&self, v: u32) -> Vec<u32> {
        let mut ring: HashSet<u32> = HashSet::new();
        for &t in &self.mesh.vertices[v as usize].conn_tets {
            for x in self.mesh.tets[t as usize] {
                if x != v {
                    ring.insert(x);
                }
            }
        }
        ring.into_iter().collect()
    }

    fn try_smooth(&mut self, v: u32, state: &RefineState, boundary_mode: bool) -> bool {
        let vert = &self.mesh.vertices[v as usize];
        if vert.conn_tets.is_empty() || vert.on_bbox {
            return false;
        }
        if !boundary_mode && vert.on_boundary {
            return false;
        }
        let on_surface = vert.on_surface;
        let ring = self.one_ring(v);
        if ring.is_empty() {
            return false;
        }
        let centroid = ring
            .iter()
            .fold(nalgebra::Vector3::zeros(), |acc, &x| {
                acc + self.mesh.vertices[x as usize].posf.coords
            })
            / ring.len() as f64;
        let start = self.mesh.vertices[v as usize].posf;
        let conn: Vec<usize> = vert.conn_tets.iter().map(|&t| t as usize).collect();
        let old_max = self.old_max_energy(&conn);

        for step in [1.0, 0.5, 0.25, 0.125] {
            let mut candidate =
                Point3::from(start.coords + (centroid - start.coords) * step);
            if on_surface && !boundary_mode {
                candidate = if state.use_onering_projection {
                    self.project_onto_onering_plane(v, &candidate)
                } else {
                    self.envelope.closest_point(&candidate)
                };
            }
            if self.accept_smooth(v, &candidate, &conn, old_max, on_surface, boundary_mode, state) {
                return true;
            }
        }
        false
    }

    /// Project onto the average plane of the incident surface facets.
    fn project_onto_onering_plane(&self, v: u32, p: &Point3<f64>) -> Point3<f64> {
        let mut normal = nalgebra::Vector3::zeros();
        let mut anchor = nalgebra::Vector3::zeros();
        let mut n = 0.0;
        for &t in &self.mesh.vertices[v as usize].conn_tets {
            let t = t as usize;
            for f in 0..4 {
                if !self.mesh.facet_tags[t][f].is_surface() {
                    continue;
                }
                let facet = self.mesh.facet(t, f);
                if !facet.contains(&v) {
                    continue;
                }
                let tri = self.facet_triangle(t, f);
                if let Some(fn_) = tri.normal() {
                    normal += fn_;
                    anchor += tri.centroid().coords;
                    n += 1.0;
                }
            }
        }
        if n == 0.0 || normal.norm_squared() < f64::EPSILON {
            return *p;
        }
        let normal = normal.normalize();
        let anchor = anchor / n;
        Point3::from(p.coords - normal * (p.coords - anchor).dot(&normal))
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_smooth(
        &mut self,
        v: u32,
        candidate: &Point3<f64>,
        conn: &[usize],
        old_max: Energy,
        on_surface: bool,
        boundary_mode: bool,
        state: &RefineState,
    ) -> bool {
        if !candidate.x.is_finite() || !candidate.y.is_finite() || !candidate.z.is_finite() {
            return false;
        }
        let exact_candidate = RationalPoint::from_f64(candidate);
        let mut new_qualities: Vec<(usize, TetQuality)> = Vec::new();
        let mut new_max = Energy::Finite(0.0);
        for &t in conn {
            let tet = self.mesh.tets[t];
            // Exact positivity with the candidate in v's slot. Doubles are
            // exact under the robust predicate; rationals only when some
            // ring vertex is unrounded.
            let all_rounded = tet
                .iter()
                .all(|&x| x == v || self.mesh.vertices[x as usize].is_rounded());
            let positive = if all_rounded {
                let pts = tet.map(|x| {
                    if x == v {
                        *candidate
                    } else {
                        self.mesh.vertices[x as usize].posf
                    }
                });
                crate::predicates::orient3d(&pts[0], &pts[1], &pts[2], &pts[3])
                    == Orientation::Positive
            } else {
                let pts = tet.map(|x| {
                    if x == v {
                        exact_candidate.clone()
                    } else {
                        self.mesh.vertices[x as usize].exact()
                    }
                });
                orient3d_rational(&pts[0], &pts[1], &pts[2], &pts[3]) == Orientation::Positive
            };
            if !positive {
                return false;
            }
            let posf = tet.map(|x| {
                if x == v {
                    *candidate
                } else {
                    self.mesh.vertices[x as usize].posf
                }
            });
            let q = TetQuality::compute(&posf[0], &posf[1], &posf[2], &posf[3]);
            new_max = new_max.max(q.slim_energy);
            new_qualities.push((t, q));
        }
        if !new_max.is_better_than(old_max) {
            return false;
        }
        if on_surface && !boundary_mode {
            for &t in conn {
                for f in 0..4 {
                    if !self.mesh.facet_tags[t][f].is_surface() {
                        continue;
                    }
                    let facet = self.mesh.facet(t, f);
                    if !facet.contains(&v) {
                        continue;
                    }
                    let pts = facet.map(|x| {
                        if x == v {
                            *candidate
                        } else {
                            self.mesh.vertices[x as usize].posf
                        }
                    });
                    let tri = Triangle::new(pts[0], pts[1], pts[2]);
                    if !self.facet_in_envelope(&tri, state) {
                        return false;
                    }
                }
            }
        }
        let vert = &mut self.mesh.vertices[v as usize];
        vert.posf = *candidate;
        vert.pos = None;
        for (t, q) in new_qualities {
            self.mesh.qualities[t] = q;
        }
        true
    }

    // ------------------------------------------------------------------
    // Adaptive sizing and rounding
    // ------------------------------------------------------------------

    /// Shrink the target edge length around vertices whose incident tets
    /// exceed the energy threshold. Returns how many were resized.
    fn update_scales(&mut self, energy_thres: f64, adaptive_scalar: f64) -> usize {
        const MIN_SCALE: f64 = 1.0e-3;
        let mut resized = 0;
        for v in 0..self.mesh.vertices.len() {
            let bad = self.mesh.vertices[v].conn_tets.iter().any(|&t| {
                self.mesh.qualities[t as usize].slim_energy.capped() > energy_thres
            });
            if bad && self.scales[v] > MIN_SCALE {
                self.scales[v] = (self.scales[v] * adaptive_scalar).max(MIN_SCALE);
                resized += 1;
            }
        }
        resized
    }

    /// Try to replace every unrounded vertex's rational position by its
    /// rounded double; a vertex stays unrounded if rounding would flip or
    /// flatten any incident tet.
    fn round_vertices(&mut self) {
        let mut rounded = 0;
        for v in 0..self.mesh.vertices.len() as u32 {
            if self.mesh.vertices[v as usize].is_rounded()
                || self.mesh.vertices[v as usize].conn_tets.is_empty()
            {
                continue;
            }
            let candidate = RationalPoint::from_f64(&self.mesh.vertices[v as usize].posf);
            let ok = self.mesh.vertices[v as usize].conn_tets.iter().all(|&t| {
                let tet = self.mesh.tets[t as usize];
                let pts = tet.map(|x| {
                    if x == v {
                        candidate.clone()
                    } else {
                        self.mesh.vertices[x as usize].exact()
                    }
                });
                orient3d_rational(&pts[0], &pts[1], &pts[2], &pts[3]) == Orientation::Positive
            });
            if ok {
                self.mesh.vertices[v as usize].pos = None;
                rounded += 1;
            }
        }
        if rounded > 0 {
            debug!("rounded {rounded} vertices");
        }
    }
}

fn pick_tag(a: FacetTag, b: FacetTag) -> FacetTag {
    let rank = |t: FacetTag| match t {
        FacetTag::Surface(_) => 3,
        FacetTag::Boundary => 2,
        FacetTag::Bbox => 1,
        FacetTag::NotSurface => 0,
    };
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::types::TriangleSoup;

    /// Single tet with one long edge, for split tests.
    fn stretched_tet_mesh() -> TetMesh {
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        mesh
    }

    fn dummy_env() -> Envelope {
        Envelope::build(&TriangleSoup::from_raw(
            &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            &[[0, 1, 2]],
        ))
    }

    fn test_state() -> RefineState {
        RefineState::new(&Config::default(), 4.0, true)
    }

    #[test]
    fn split_inserts_midpoint_and_keeps_orientation() {
        let mut mesh = stretched_tet_mesh();
        let env = dummy_env();
        let state = test_state();
        let config = Config::default();
        let mut refiner = Refiner {
            mesh: &mut mesh,
            envelope: &env,
            config: &config,
            scales: vec![1.0; 4],
        };
        assert!(refiner.try_split(0, 1, &state));
        assert_eq!(mesh.active_tet_count(), 2);
        assert_eq!(mesh.vertices.len(), 5);
        let mid = mesh.vertices[4].posf;
        assert!((mid - Point3::new(2.0, 0.0, 0.0)).norm() < 1e-12);
        for t in mesh.active_tets() {
            let [a, b, c, d] = mesh.tet_points(t);
            assert_eq!(
                crate::predicates::orient3d(&a, &b, &c, &d),
                Orientation::Positive
            );
        }
        // Vertex-tet incidence stays consistent.
        for (v, vert) in mesh.vertices.iter().enumerate() {
            for &t in &vert.conn_tets {
                assert!(mesh.tets[t as usize].contains(&(v as u32)));
                assert!(!mesh.removed[t as usize]);
            }
        }
    }

    #[test]
    fn collapse_removes_a_sliver() {
        // Unit tet plus a nearly flat sliver glued under its base: pulling
        // the sliver apex onto a base corner kills the sliver and improves
        // the worst energy.
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.3, 0.3, -0.01),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        mesh.push_tet([0, 2, 1, 4], [FacetTag::NotSurface; 4]);
        quality::compute_all(&mut mesh);

        let env = dummy_env();
        let state = test_state();
        let config = Config::default();
        let mut refiner = Refiner {
            mesh: &mut mesh,
            envelope: &env,
            config: &config,
            scales: vec![1.0; 5],
        };
        assert!(refiner.try_collapse(4, 0, &state));
        assert_eq!(mesh.active_tet_count(), 1);
        assert!(mesh.vertices[4].conn_tets.is_empty());
        for t in mesh.active_tets() {
            let [a, b, c, d] = mesh.tet_points(t);
            assert_eq!(
                crate::predicates::orient3d(&a, &b, &c, &d),
                Orientation::Positive
            );
        }
    }

    #[test]
    fn collapse_rejects_inversion() {
        // A star where moving vertex 0 onto vertex 1 flips a tet inside
        // out: the collapse must be rejected wholesale.
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.1, -1.0, 0.0),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        // Tet on vertex 0 whose facet (2, 3, 4) separates 0 from 1.
        mesh.push_tet([0, 2, 3, 4], [FacetTag::NotSurface; 4]);
        quality::compute_all(&mut mesh);
        for t in mesh.active_tets() {
            let [a, b, c, d] = mesh.tet_points(t);
            assert_eq!(
                crate::predicates::orient3d(&a, &b, &c, &d),
                Orientation::Positive,
                "fixture tet {t}"
            );
        }

        let env = dummy_env();
        let state = test_state();
        let config = Config::default();
        let mut refiner = Refiner {
            mesh: &mut mesh,
            envelope: &env,
            config: &config,
            scales: vec![1.0; 5],
        };
        assert!(!refiner.try_collapse(0, 1, &state));
        assert_eq!(mesh.active_tet_count(), 2);
    }

    #[test]
    fn smooth_improves_distorted_star() {
        // Interior vertex pushed near one side of its star; smoothing must
        // move it and lower the max energy without inverting anything.
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 1.0, 0.0),
            Point3::new(0.5, 0.35, 1.0),
            Point3::new(0.52, 0.34, 0.1), // distorted interior vertex
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        mesh.push_tet([0, 1, 2, 4], [FacetTag::NotSurface; 4]);
        // Upper shell around vertex 4.
        for tet in [[0u32, 1, 4, 3], [1, 2, 4, 3], [2, 0, 4, 3]] {
            let [a, b, c, d] = tet.map(|v| mesh.vertices[v as usize].posf);
            assert_eq!(
                crate::predicates::orient3d(&a, &b, &c, &d),
                Orientation::Positive,
                "fixture tet {tet:?}"
            );
            mesh.push_tet(tet, [FacetTag::NotSurface; 4]);
        }
        let before = quality::compute_all(&mut mesh);

        let env = dummy_env();
        let state = test_state();
        let config = Config::default();
        let mut refiner = Refiner {
            mesh: &mut mesh,
            envelope: &env,
            config: &config,
            scales: vec![1.0; 5],
        };
        let moved = refiner.try_smooth(4, &state, false);
        assert!(moved, "smoothing should accept an improving move");
        let after = quality::compute_all(&mut mesh);
        assert!(
            after.max < before.max,
            "max energy should drop: {} -> {}",
            before.max,
            after.max
        );
        for t in mesh.active_tets() {
            let [a, b, c, d] = mesh.tet_points(t);
            assert_eq!(
                crate::predicates::orient3d(&a, &b, &c, &d),
                Orientation::Positive
            );
        }
    }

    #[test]
    fn pick_tag_prefers_surface() {
        assert_eq!(
            pick_tag(FacetTag::Surface(3), FacetTag::Bbox),
            FacetTag::Surface(3)
        );
        assert_eq!(
            pick_tag(FacetTag::NotSurface, FacetTag::Boundary),
            FacetTag::Boundary
        );
        assert_eq!(pick_tag(FacetTag::NotSurface, FacetTag::NotSurface), FacetTag::NotSurface);
    }
}
