//! Physical consistency checks for rotor scan energy profiles.
//!
//! A rotor scan rotates a torsion in fixed increments and records the relative
//! energy at each step. [`scan_quality_check`] rejects profiles that cannot be
//! trusted, and suggests how to rerun the scan:
//!
//! 1. the profile does not close on itself (first and last energies differ)
//! 2. two consecutive points jump too far apart
//! 3. for transition states, a bond or dihedral that must be preserved changed
//! 4. a lower conformer than the scan's starting point was found
//! 5. the barrier is too high for a single-well rotor
//!
//! Energies are in kJ/mol relative to the profile minimum.

use crate::geometry::Geometry;
use crate::settings::ScanThresholds;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An initial-conformer energy this far above the scan minimum (kJ/mol) always
/// invalidates the scan.
pub const MIN_CONFORMER_ENERGY_GAP: f64 = 2.0;

/// How to rerun a rejected scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanAction {
    /// Use a finer resolution
    IncRes,
    /// Freeze all other torsions
    Freeze,
    /// Restart from the lower conformer found by the scan
    ChangeConformer {
        /// Pivot atoms of the scanned torsion
        pivots: [usize; 2],
        /// Rotation in degrees from the original conformer to the lower one
        increment_deg: f64,
    },
}

/// Outcome of [`scan_quality_check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanQualityVerdict {
    /// Whether the scan must be discarded
    pub invalidate: bool,
    /// Short reason for the user
    pub reason: String,
    /// Detailed message for the log
    pub message: String,
    /// Suggested reruns, possibly empty
    pub actions: Vec<ScanAction>,
}

impl ScanQualityVerdict {
    fn valid() -> Self {
        Self {
            invalidate: false,
            reason: String::new(),
            message: String::new(),
            actions: Vec::new(),
        }
    }

    fn invalid(reason: String, message: String, actions: Vec<ScanAction>) -> Self {
        Self {
            invalidate: true,
            reason,
            message,
            actions,
        }
    }
}

/// A finished rotor scan and its species context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCheck {
    /// Species label
    pub label: String,
    /// Pivot atoms of the scanned torsion (zero-based)
    pub pivots: [usize; 2],
    /// Relative energies along the scan, kJ/mol
    pub energies: Vec<f64>,
    /// Scan resolution in degrees; the configured default when absent
    #[serde(default)]
    pub scan_res: Option<f64>,
    /// Action sets already used for this rotor
    #[serde(default)]
    pub used_methods: Vec<Vec<ScanAction>>,
    /// Whether the species is a transition state
    #[serde(default)]
    pub is_ts: bool,
    /// Atom pairs whose distance (and dihedral) must hold along a TS scan
    #[serde(default)]
    pub preserve_params: Option<Vec<[usize; 2]>>,
    /// Geometries along the scan, one per energy
    #[serde(default)]
    pub trajectory: Vec<Geometry>,
    /// Geometry the scan started from
    #[serde(default)]
    pub original_xyz: Option<Geometry>,
}

/// Estimates the number of wells of a rotor potential.
pub trait RotorSymmetry {
    /// Number of wells in the profile, or `None` if it cannot be determined.
    fn num_wells(&self, label: &str, pivots: [usize; 2], energies: &[f64]) -> Option<usize>;
}

/// Counts wells as local minima of the cyclic profile.
///
/// Wiggles smaller than `tolerance` (kJ/mol) are not counted as separate wells.
#[derive(Debug, Clone, Copy)]
pub struct WellCounter {
    /// Minimum depth of a well, kJ/mol
    pub tolerance: f64,
}

impl Default for WellCounter {
    fn default() -> Self {
        Self { tolerance: 1.0 }
    }
}

impl RotorSymmetry for WellCounter {
    fn num_wells(&self, _label: &str, _pivots: [usize; 2], energies: &[f64]) -> Option<usize> {
        let mut profile = energies.to_vec();
        if profile.len() >= 2 {
            let last = profile.len() - 1;
            // A closed 360 degree scan repeats its first point.
            if (profile[0] - profile[last]).abs() < self.tolerance {
                profile.pop();
            }
        }
        let n = profile.len();
        if n < 3 || profile.iter().any(|e| !e.is_finite()) {
            return None;
        }
        let start = profile
            .iter()
            .enumerate()
            .fold(0, |best, (i, e)| if *e > profile[best] { i } else { best });

        let mut wells = 0;
        let mut descending = true;
        let mut extreme = profile[start];
        for k in 1..=n {
            let e = profile[(start + k) % n];
            if descending {
                if e < extreme {
                    extreme = e;
                } else if e - extreme > self.tolerance {
                    wells += 1;
                    descending = false;
                    extreme = e;
                }
            } else if e > extreme {
                extreme = e;
            } else if extreme - e > self.tolerance {
                descending = true;
                extreme = e;
            }
        }
        Some(wells.max(1))
    }
}

/// Bond graph of a molecule.
pub trait MoleculeGraph {
    /// Atoms bonded to `atom`.
    fn neighbors(&self, atom: usize) -> Vec<usize>;
}

/// [`MoleculeGraph`] from an adjacency list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdjacencyGraph {
    bonds: HashMap<usize, Vec<usize>>,
}

impl AdjacencyGraph {
    /// Builds the graph from bonded atom pairs.
    pub fn from_bonds(bonds: &[[usize; 2]]) -> Self {
        let mut graph = AdjacencyGraph::default();
        for [a, b] in bonds.iter().copied() {
            graph.bonds.entry(a).or_default().push(b);
            graph.bonds.entry(b).or_default().push(a);
        }
        for neighbors in graph.bonds.values_mut() {
            neighbors.sort_unstable();
            neighbors.dedup();
        }
        graph
    }
}

impl MoleculeGraph for AdjacencyGraph {
    fn neighbors(&self, atom: usize) -> Vec<usize> {
        self.bonds.get(&atom).cloned().unwrap_or_default()
    }
}

/// Torsion around the bond a-b, using the lowest-index neighbor on each side.
fn torsion_around(graph: &dyn MoleculeGraph, a: usize, b: usize) -> Option<[usize; 4]> {
    let left = graph.neighbors(a).into_iter().filter(|n| *n != b).min()?;
    let right = graph.neighbors(b).into_iter().filter(|n| *n != a).min()?;
    Some([left, a, b, right])
}

fn outside_band(ratio: f64, tolerance: f64) -> bool {
    !ratio.is_finite() || ratio > 1.0 + tolerance || ratio < 1.0 / (1.0 + tolerance)
}

/// First atom of a preserved pair (or of its torsion) that some scan geometry
/// does not have.
fn missing_atom(check: &ScanCheck, pairs: &[[usize; 2]], graph: Option<&dyn MoleculeGraph>) -> Option<usize> {
    let num_atoms = check
        .trajectory
        .iter()
        .chain(check.original_xyz.as_ref())
        .map(|g| g.num_atoms)
        .min()?;
    pairs
        .iter()
        .flat_map(|&[a, b]| {
            let mut atoms = vec![a, b];
            if a < num_atoms && b < num_atoms {
                if let Some(torsion) = graph.and_then(|g| torsion_around(g, a, b)) {
                    atoms.extend(torsion);
                }
            }
            atoms
        })
        .find(|atom| *atom >= num_atoms)
}

/// Checks a TS scan for broken preserved parameters. Returns the violation.
fn preserved_params_violation(
    check: &ScanCheck,
    pairs: &[[usize; 2]],
    tolerance: f64,
    graph: Option<&dyn MoleculeGraph>,
) -> Option<String> {
    if graph.is_none() {
        warn!(
            "No bond graph for {}; checking preserved distances only, not dihedrals",
            check.label
        );
    }
    let reference = check.original_xyz.as_ref();
    for (frame, window) in check.trajectory.windows(2).enumerate() {
        let (previous, current) = (&window[0], &window[1]);
        for &[a, b] in pairs {
            let mut measures: Vec<(&str, f64, f64, Option<f64>)> = vec![(
                "distance",
                current.distance(a, b),
                previous.distance(a, b),
                reference.map(|r| r.distance(a, b)),
            )];
            if let Some(torsion) = graph.and_then(|g| torsion_around(g, a, b)) {
                let [i, j, k, l] = torsion;
                measures.push((
                    "dihedral",
                    current.dihedral(i, j, k, l),
                    previous.dihedral(i, j, k, l),
                    reference.map(|r| r.dihedral(i, j, k, l)),
                ));
            }
            for (what, now, before, original) in measures {
                let against_previous = outside_band(now / before, tolerance);
                let against_original = original.map_or(false, |o| outside_band(now / o, tolerance));
                if against_previous || against_original {
                    return Some(format!(
                        "The {} around atoms {} and {} changed at scan point {} ({:.3} vs {:.3} at the previous point).",
                        what,
                        a,
                        b,
                        frame + 1,
                        now,
                        before
                    ));
                }
            }
        }
    }
    None
}

/// Validates a rotor scan energy profile.
///
/// The checks run in order and the first failure decides. A profile whose
/// barrier exceeds `maximum_barrier` is rejected only when `symmetry` reports a
/// single well; an undeterminable well count is logged and accepted.
///
/// # Examples
///
/// ```
/// use esstrsh::scan::{scan_quality_check, ScanAction, ScanCheck, WellCounter};
/// use esstrsh::settings::ScanThresholds;
///
/// let check = ScanCheck {
///     label: "CH3OH".to_string(),
///     pivots: [0, 1],
///     energies: vec![0.0, 5.0, 10.0, 5.0, 12.0],
///     scan_res: Some(8.0),
///     used_methods: vec![],
///     is_ts: false,
///     preserve_params: None,
///     trajectory: vec![],
///     original_xyz: None,
/// };
/// let thresholds = ScanThresholds { inconsistency_az: 8.0, ..ScanThresholds::default() };
/// let verdict = scan_quality_check(&check, &thresholds, &WellCounter::default(), None);
/// assert!(verdict.invalidate);
/// assert_eq!(verdict.actions, vec![ScanAction::IncRes, ScanAction::Freeze]);
/// ```
pub fn scan_quality_check(
    check: &ScanCheck,
    thresholds: &ScanThresholds,
    symmetry: &dyn RotorSymmetry,
    graph: Option<&dyn MoleculeGraph>,
) -> ScanQualityVerdict {
    let energies = &check.energies;
    let label = &check.label;
    let pivots = check.pivots;
    if energies.is_empty() {
        return ScanQualityVerdict::invalid(
            "no energies".to_string(),
            format!("The rotor scan of {} around pivots {:?} has no energies.", label, pivots),
            Vec::new(),
        );
    }
    let first = energies[0];
    let last = energies[energies.len() - 1];
    let max = energies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let (min_index, min) = energies
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, e)| if e < best.1 { (i, e) } else { best });

    // 1. The scan must end where it started.
    if (last - first).abs() > thresholds.inconsistency_az {
        let reason = "Inconsistent initial and final conformers".to_string();
        let message = format!(
            "Rotor scan of {} between pivots {:?} has inconsistent initial and final conformers: the energies differ by {:.2} kJ/mol.",
            label,
            pivots,
            (last - first).abs()
        );
        error!("{}", message);
        return ScanQualityVerdict::invalid(reason, message, vec![ScanAction::IncRes, ScanAction::Freeze]);
    }

    // 2. No jumps between consecutive points.
    for (j, pair) in energies.windows(2).enumerate() {
        let gap = (pair[0] - pair[1]).abs();
        if gap > thresholds.inconsistency_ab * max {
            let reason = "Significant difference observed between consecutive conformers".to_string();
            let message = format!(
                "Rotor scan of {} between pivots {:?} is inconsistent between points {} and {}: {:.2} kJ/mol apart.",
                label,
                pivots,
                j,
                j + 1,
                gap
            );
            error!("{}", message);
            let inc_res = vec![ScanAction::IncRes];
            let both = vec![ScanAction::IncRes, ScanAction::Freeze];
            let actions = if !check.used_methods.contains(&inc_res) {
                inc_res
            } else if !check.used_methods.contains(&both) {
                both
            } else {
                Vec::new()
            };
            return ScanQualityVerdict::invalid(reason, message, actions);
        }
    }

    // 3. Transition states must keep their reactive bonds.
    if check.is_ts {
        if let Some(pairs) = check.preserve_params.as_deref() {
            if let Some(atom) = missing_atom(check, pairs, graph) {
                let message = format!(
                    "Rotor scan of TS {} between pivots {:?}: atom {} of the parameters to preserve is not in the scan geometries.",
                    label, pivots, atom
                );
                error!("{}", message);
                return ScanQualityVerdict::invalid(
                    "Parameters to preserve reference atoms outside the geometry".to_string(),
                    message,
                    Vec::new(),
                );
            }
            if let Some(violation) = preserved_params_violation(
                check,
                pairs,
                thresholds.preserve_param_in_scan_ratio,
                graph,
            ) {
                let message = format!("Rotor scan of TS {} between pivots {:?}: {}", label, pivots, violation);
                error!("{}", message);
                return ScanQualityVerdict::invalid(
                    "Bond or dihedral to preserve changed along the scan".to_string(),
                    message,
                    Vec::new(),
                );
            }
        }
    }

    // 4. A lower conformer means the scan started from the wrong one.
    if !check.is_ts {
        let above_min = first - min;
        if above_min >= MIN_CONFORMER_ENERGY_GAP || above_min > 0.5 * (max - min) {
            let scan_res = check.scan_res.unwrap_or(thresholds.rotor_scan_resolution);
            let increment_deg = min_index as f64 * scan_res;
            let action = ScanAction::ChangeConformer {
                pivots,
                increment_deg,
            };
            let reason = format!("Another conformer for {} exists which is {:.2} kJ/mol lower.", label, above_min);
            let message = format!(
                "Species {} is not oriented correctly around pivots {:?}, searching for a better conformation {:.1} degrees away.",
                label, pivots, increment_deg
            );
            let already_used = check
                .used_methods
                .iter()
                .any(|methods| methods.contains(&action));
            let actions = if already_used {
                error!(
                    "The conformer change of {} around {:?} by {} degrees was already tried",
                    label, pivots, increment_deg
                );
                Vec::new()
            } else {
                info!("{}", message);
                vec![action]
            };
            return ScanQualityVerdict::invalid(reason, message, actions);
        }
    }

    // 5. A single well with a huge barrier is unphysical.
    let barrier = max - min;
    if barrier > thresholds.maximum_barrier {
        match symmetry.num_wells(label, pivots, energies) {
            Some(1) => {
                let reason = format!("The rotor scan has a barrier of {:.2} kJ/mol, which is higher than the maximal barrier for rotation ({:.2} kJ/mol)", barrier, thresholds.maximum_barrier);
                let message = format!(
                    "Rotor scan of {} between pivots {:?} has a single well with a {:.2} kJ/mol barrier; not considering it as a torsional mode.",
                    label, pivots, barrier
                );
                warn!("{}", message);
                return ScanQualityVerdict::invalid(reason, message, Vec::new());
            }
            Some(wells) => {
                warn!(
                    "Rotor scan of {} between pivots {:?} has a {:.2} kJ/mol barrier with {} wells",
                    label, pivots, barrier, wells
                );
            }
            None => {
                warn!(
                    "Rotor scan of {} between pivots {:?} has a {:.2} kJ/mol barrier, but its number of wells could not be determined",
                    label, pivots, barrier
                );
            }
        }
    }

    debug!("Rotor scan of {} between pivots {:?} is valid", label, pivots);
    ScanQualityVerdict::valid()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(energies: Vec<f64>) -> ScanCheck {
        ScanCheck {
            label: "spc".to_string(),
            pivots: [1, 2],
            energies,
            scan_res: Some(8.0),
            used_methods: Vec::new(),
            is_ts: false,
            preserve_params: None,
            trajectory: Vec::new(),
            original_xyz: None,
        }
    }

    fn thresholds() -> ScanThresholds {
        ScanThresholds::default()
    }

    struct FixedWells(Option<usize>);

    impl RotorSymmetry for FixedWells {
        fn num_wells(&self, _: &str, _: [usize; 2], _: &[f64]) -> Option<usize> {
            self.0
        }
    }

    #[test]
    fn test_inconsistent_endpoints() {
        let c = check(vec![0.0, 5.0, 10.0, 5.0, 12.0]);
        let t = ScanThresholds {
            inconsistency_az: 8.0,
            ..thresholds()
        };
        let verdict = scan_quality_check(&c, &t, &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert_eq!(verdict.actions, vec![ScanAction::IncRes, ScanAction::Freeze]);
    }

    #[test]
    fn test_consecutive_jump_escalates() {
        let mut c = check(vec![0.0, 1.0, 30.0, 1.0, 0.0]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert_eq!(verdict.actions, vec![ScanAction::IncRes]);

        c.used_methods = vec![vec![ScanAction::IncRes]];
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert_eq!(verdict.actions, vec![ScanAction::IncRes, ScanAction::Freeze]);

        c.used_methods.push(vec![ScanAction::IncRes, ScanAction::Freeze]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert!(verdict.actions.is_empty());
    }

    #[test]
    fn test_lower_conformer_found() {
        let c = check(vec![3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert_eq!(
            verdict.actions,
            vec![ScanAction::ChangeConformer {
                pivots: [1, 2],
                increment_deg: 56.0
            }]
        );
    }

    #[test]
    fn test_lower_conformer_uses_configured_resolution() {
        let mut c = check(vec![3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0]);
        c.scan_res = None;
        let t = ScanThresholds {
            rotor_scan_resolution: 10.0,
            ..thresholds()
        };
        let verdict = scan_quality_check(&c, &t, &WellCounter::default(), None);
        assert_eq!(
            verdict.actions,
            vec![ScanAction::ChangeConformer {
                pivots: [1, 2],
                increment_deg: 70.0
            }]
        );
    }

    #[test]
    fn test_lower_conformer_already_tried() {
        let mut c = check(vec![3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0]);
        c.used_methods = vec![vec![ScanAction::ChangeConformer {
            pivots: [1, 2],
            increment_deg: 56.0,
        }]];
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert!(verdict.actions.is_empty());
    }

    #[test]
    fn test_high_barrier_single_well() {
        let c = check(vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 40.0, 30.0, 20.0, 10.0, 0.0]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert!(verdict.actions.is_empty());
    }

    #[test]
    fn test_high_barrier_two_wells_is_valid() {
        let c = check(vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 40.0, 30.0, 20.0, 10.0, 0.0]);
        let verdict = scan_quality_check(&c, &thresholds(), &FixedWells(Some(2)), None);
        assert!(!verdict.invalidate);
        let verdict = scan_quality_check(&c, &thresholds(), &FixedWells(None), None);
        assert!(!verdict.invalidate);
    }

    #[test]
    fn test_well_counter() {
        let counter = WellCounter::default();
        let one = [0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 40.0, 30.0, 20.0, 10.0, 0.0];
        assert_eq!(counter.num_wells("spc", [0, 1], &one), Some(1));
        let two = [0.0, 25.0, 50.0, 25.0, 0.0, 25.0, 50.0, 25.0, 0.0];
        assert_eq!(counter.num_wells("spc", [0, 1], &two), Some(2));
        let three = [0.0, 5.0, 0.0, 5.0, 0.0, 5.0, 0.0];
        assert_eq!(counter.num_wells("spc", [0, 1], &three), Some(3));
        assert_eq!(counter.num_wells("spc", [0, 1], &[0.0, 1.0]), None);
    }

    #[test]
    fn test_valid_scan() {
        let c = check(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(!verdict.invalidate);
    }

    fn stretched(d: f64) -> Geometry {
        Geometry::new(
            vec!["C".into(), "C".into(), "H".into(), "H".into()],
            vec![
                0.0, 0.0, 0.0, //
                d, 0.0, 0.0, //
                -0.5, 1.0, 0.0, //
                d + 0.5, 1.0, 0.3,
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ts_preserved_bond_broken() {
        let mut c = check(vec![0.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        c.is_ts = true;
        c.preserve_params = Some(vec![[0, 1]]);
        c.trajectory = vec![stretched(1.5), stretched(1.52), stretched(2.2)];
        c.original_xyz = Some(stretched(1.5));
        let graph = AdjacencyGraph::from_bonds(&[[0, 1], [0, 2], [1, 3]]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), Some(&graph as &dyn MoleculeGraph));
        assert!(verdict.invalidate);
        assert!(verdict.actions.is_empty());
        assert!(verdict.message.contains("distance"));
    }

    #[test]
    fn test_ts_preserved_bond_kept_without_graph() {
        let mut c = check(vec![0.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        c.is_ts = true;
        c.preserve_params = Some(vec![[0, 1]]);
        c.trajectory = vec![stretched(1.5), stretched(1.52), stretched(1.55)];
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(!verdict.invalidate);
    }

    fn twisted(z: f64) -> Geometry {
        Geometry::new(
            vec!["C".into(), "C".into(), "H".into(), "H".into()],
            vec![
                0.0, 0.0, 0.0, //
                1.5, 0.0, 0.0, //
                -0.5, 1.0, 0.0, //
                2.0, 1.0, z,
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ts_preserved_dihedral_changed() {
        let mut c = check(vec![0.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        c.is_ts = true;
        c.preserve_params = Some(vec![[0, 1]]);
        // H2-C0-C1-H3 goes 16.7, 17.7, then 38.7 degrees; the C0-C1 bond holds.
        c.trajectory = vec![twisted(-0.3), twisted(-0.32), twisted(-0.8)];
        c.original_xyz = Some(twisted(-0.3));
        let graph = AdjacencyGraph::from_bonds(&[[0, 1], [0, 2], [1, 3]]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), Some(&graph as &dyn MoleculeGraph));
        assert!(verdict.invalidate);
        assert!(verdict.message.contains("dihedral"));
        assert!(verdict.message.contains("scan point 2"));

        c.trajectory = vec![twisted(-0.3), twisted(-0.32), twisted(-0.31)];
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), Some(&graph as &dyn MoleculeGraph));
        assert!(!verdict.invalidate);
    }

    #[test]
    fn test_ts_drift_from_original_geometry() {
        let mut c = check(vec![0.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        c.is_ts = true;
        c.preserve_params = Some(vec![[0, 1]]);
        // Each step stays within 10% but the bond ends 13% longer than it started.
        c.trajectory = vec![stretched(1.5), stretched(1.6), stretched(1.7)];
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(!verdict.invalidate);

        c.original_xyz = Some(stretched(1.5));
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert!(verdict.message.contains("distance"));
        assert!(verdict.message.contains("scan point 2"));
    }

    #[test]
    fn test_ts_preserved_atoms_outside_geometry() {
        let diatomic = Geometry::new(vec!["H".into(), "H".into()], vec![0.0, 0.0, 0.0, 0.74, 0.0, 0.0]).unwrap();
        let mut c = check(vec![0.0; 46]);
        c.is_ts = true;
        c.preserve_params = Some(vec![[0, 5]]);
        c.trajectory = vec![diatomic.clone(), diatomic];
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), None);
        assert!(verdict.invalidate);
        assert!(verdict.actions.is_empty());
        assert!(verdict.message.contains("atom 5"));

        // A bonded neighbor the geometry lacks is caught through the torsion.
        let mut c = check(vec![0.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        c.is_ts = true;
        c.preserve_params = Some(vec![[0, 1]]);
        c.trajectory = vec![stretched(1.5), stretched(1.5)];
        let graph = AdjacencyGraph::from_bonds(&[[0, 1], [0, 2], [1, 7]]);
        let verdict = scan_quality_check(&c, &thresholds(), &WellCounter::default(), Some(&graph as &dyn MoleculeGraph));
        assert!(verdict.invalidate);
        assert!(verdict.message.contains("atom 7"));
    }

    #[test]
    fn test_adjacency_graph_torsion() {
        let graph = AdjacencyGraph::from_bonds(&[[0, 1], [1, 2], [2, 3], [1, 4], [2, 5]]);
        assert_eq!(torsion_around(&graph, 1, 2), Some([0, 1, 2, 3]));
        assert_eq!(torsion_around(&graph, 0, 1), None);
    }

    #[test]
    fn test_scan_action_serde() {
        let json = serde_json::to_string(&vec![
            ScanAction::IncRes,
            ScanAction::ChangeConformer {
                pivots: [1, 2],
                increment_deg: 16.0,
            },
        ])
        .unwrap();
        assert_eq!(
            json,
            "[\"inc_res\",{\"change_conformer\":{\"pivots\":[1,2],\"increment_deg\":16.0}}]"
        );
    }
}
