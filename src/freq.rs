//! Troubleshooting of species with imaginary (negative) frequencies.
//!
//! A non-TS species whose frequency job shows a negative frequency sits on a
//! saddle point. [`perturb_geometry`] pushes the geometry both ways along the
//! displacement vector of the offending mode, giving two new conformers to
//! optimize. Repeated failures escalate the displacement, and after
//! [`MAX_NEG_FREQ_TRSH_ATTEMPTS`] attempts the species is given up.

use crate::geometry::Geometry;
use crate::parser::{FrequencySource, NormalModes, ParseError};
use crate::trsh::{Result, TrshError};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of previous attempts after which a species is invalidated.
pub const MAX_NEG_FREQ_TRSH_ATTEMPTS: usize = 10;

/// Displacement factor of a first attempt.
pub const DEFAULT_PERTURBATION_FACTOR: f64 = 1.1;

/// Result of a negative frequency troubleshooting attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NegFreqOutcome {
    /// Frequencies addressed now, rounded to 2 decimals
    pub current_neg_freqs_trshed: Vec<f64>,
    /// New geometries to optimize, two per addressed mode
    pub conformers: Vec<Geometry>,
    /// Errors to report
    pub errors: Vec<String>,
    /// Warnings to report
    pub warnings: Vec<String>,
}

/// Same test as numpy's `allclose(a, b, rtol=1e-4, atol=1e-2)`.
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-2 + 1e-4 * b.abs()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Perturbs `geometry` along its imaginary modes.
///
/// `tried` holds the frequencies troubleshot in earlier attempts and
/// `job_types` the workflow's enabled job types (used to report whether rotor
/// scans could have helped). Four cases select the modes and factor:
///
/// | Negative modes | Seen before | Modes displaced | Factor |
/// |----------------|-------------|-----------------|--------|
/// | 1 | no attempts yet | largest | 1.1 |
/// | 1 | yes | largest | `1 + 0.1 * (attempts + 1)` |
/// | > 1 | no | largest | 1.1 |
/// | > 1 | yes | all | 1.1 |
///
/// # Errors
///
/// Returns [`TrshError::NoNegativeFrequency`] if the first frequency is not
/// negative, and [`TrshError::Geometry`] if a displacement does not match
/// the geometry.
pub fn perturb_geometry(
    label: &str,
    modes: &NormalModes,
    geometry: &Geometry,
    tried: &[f64],
    job_types: &[String],
) -> Result<NegFreqOutcome> {
    let mut outcome = NegFreqOutcome::default();
    if tried.len() > MAX_NEG_FREQ_TRSH_ATTEMPTS {
        error!("Species {} was troubleshot for negative frequencies too many times.", label);
        if !job_types.iter().any(|j| j == "rotors") {
            error!("The rotor scans feature is turned off, cannot troubleshoot geometry using dihedral modifications.");
            outcome.warnings.push("rotors = False; ".to_string());
        }
        error!("Invalidating species {}.", label);
        outcome
            .errors
            .push("Error: Encountered negative frequencies too many times; ".to_string());
        return Ok(outcome);
    }

    let freqs = &modes.frequencies;
    // Frequencies are sorted, the negative ones come first.
    let negative: Vec<usize> = freqs.iter().take_while(|f| **f < 0.0).enumerate().map(|(i, _)| i).collect();
    let largest = negative
        .iter()
        .copied()
        .fold(None, |best: Option<usize>, i| match best {
            Some(b) if freqs[b] <= freqs[i] => Some(b),
            _ => Some(i),
        })
        .ok_or_else(|| TrshError::NoNegativeFrequency(label.to_string()))?;

    let seen = tried.iter().any(|vf| is_close(freqs[0], *vf));
    let mut factor = DEFAULT_PERTURBATION_FACTOR;
    let selected: Vec<usize> = if negative.len() == 1 && tried.is_empty() {
        info!(
            "Species {} has a negative frequency ({}). Perturbing its geometry using the respective vibrational displacements",
            label, freqs[largest]
        );
        vec![largest]
    } else if negative.len() == 1 && seen {
        factor = 1.0 + 0.1 * (tried.len() as f64 + 1.0);
        info!(
            "Species {} has a negative frequency ({}) for the {} time. Perturbing its geometry using a larger factor (x {})",
            label,
            freqs[largest],
            tried.len(),
            factor
        );
        vec![largest]
    } else if negative.len() > 1 && !seen {
        info!(
            "Species {} has {} negative frequencies. Perturbing its geometry along the largest one, {}",
            label,
            negative.len(),
            freqs[largest]
        );
        vec![largest]
    } else {
        info!(
            "Species {} has {} negative frequencies. Perturbing its geometry along all of them",
            label,
            negative.len()
        );
        negative.clone()
    };

    outcome.current_neg_freqs_trshed = selected.iter().map(|i| round2(freqs[*i])).collect();
    for index in selected {
        let displacement = modes
            .displacements
            .get(index)
            .ok_or_else(|| ParseError::Missing(format!("displacement of mode {}", index)))?;
        for sign in [1.0, -1.0] {
            outcome.conformers.push(geometry.displaced(displacement, sign * factor)?);
        }
    }
    Ok(outcome)
}

/// Reads a frequency job log through `source` and perturbs its geometry.
///
/// A source that cannot parse this output yields an empty outcome, logged as
/// an error.
pub fn trsh_negative_freq(
    label: &str,
    log_path: &Path,
    tried: &[f64],
    job_types: &[String],
    source: &dyn FrequencySource,
) -> Result<NegFreqOutcome> {
    let modes = match source.parse_normal_modes(log_path) {
        Ok(modes) => modes,
        Err(e @ ParseError::Unsupported { .. }) => {
            error!("Could not troubleshoot negative frequency for species {}, got: {}", label, e);
            return Ok(NegFreqOutcome::default());
        }
        Err(e) => return Err(e.into()),
    };
    let geometry = source.parse_geometry(log_path)?;
    perturb_geometry(label, &modes, &geometry, tried, job_types)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h2o() -> Geometry {
        Geometry::new(
            vec!["O".into(), "H".into(), "H".into()],
            vec![0.0, 0.0, 0.12, 0.0, 0.76, -0.48, 0.0, -0.76, -0.48],
        )
        .unwrap()
    }

    fn modes(frequencies: Vec<f64>) -> NormalModes {
        let displacements = frequencies
            .iter()
            .enumerate()
            .map(|(i, _)| vec![[0.0, 0.0, 0.1 * (i + 1) as f64], [0.0, 0.2, 0.0], [0.0, -0.2, 0.0]])
            .collect();
        NormalModes {
            frequencies,
            displacements,
        }
    }

    #[test]
    fn test_single_negative_first_attempt() {
        let outcome = perturb_geometry("spc", &modes(vec![-100.0, 50.0, 300.0]), &h2o(), &[], &[]).unwrap();
        assert_eq!(outcome.current_neg_freqs_trshed, vec![-100.0]);
        assert_eq!(outcome.conformers.len(), 2);
        let plus = outcome.conformers[0].get_atom_coords(1);
        let minus = outcome.conformers[1].get_atom_coords(1);
        assert!((plus[1] - (0.76 + 1.1 * 0.2)).abs() < 1e-12);
        assert!((minus[1] - (0.76 - 1.1 * 0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_single_negative_seen_escalates() {
        let outcome =
            perturb_geometry("spc", &modes(vec![-100.004, 50.0]), &h2o(), &[-100.0, -80.0], &[]).unwrap();
        // factor 1 + 0.1 * 3 = 1.3
        let plus = outcome.conformers[0].get_atom_coords(0);
        assert!((plus[2] - (0.12 + 1.3 * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_multiple_negative_unseen_takes_largest() {
        let outcome = perturb_geometry("spc", &modes(vec![-50.0, -200.0, 30.0]), &h2o(), &[-10.0], &[]).unwrap();
        assert_eq!(outcome.current_neg_freqs_trshed, vec![-200.0]);
        assert_eq!(outcome.conformers.len(), 2);
    }

    #[test]
    fn test_multiple_negative_seen_takes_all() {
        let outcome = perturb_geometry("spc", &modes(vec![-50.0, -200.0, 30.0]), &h2o(), &[-50.0], &[]).unwrap();
        assert_eq!(outcome.current_neg_freqs_trshed, vec![-50.0, -200.0]);
        assert_eq!(outcome.conformers.len(), 4);
    }

    #[test]
    fn test_too_many_attempts() {
        let tried = vec![-100.0; 11];
        let outcome = perturb_geometry("spc", &modes(vec![-100.0]), &h2o(), &tried, &[]).unwrap();
        assert!(outcome.conformers.is_empty());
        assert_eq!(outcome.errors, vec!["Error: Encountered negative frequencies too many times; "]);
        assert_eq!(outcome.warnings, vec!["rotors = False; "]);

        let outcome =
            perturb_geometry("spc", &modes(vec![-100.0]), &h2o(), &tried, &["rotors".to_string()]).unwrap();
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_no_negative_frequency() {
        let result = perturb_geometry("spc", &modes(vec![20.0, 50.0]), &h2o(), &[], &[]);
        assert!(matches!(result, Err(TrshError::NoNegativeFrequency(_))));
    }

    #[test]
    fn test_rounding() {
        let outcome = perturb_geometry("spc", &modes(vec![-123.4567, 20.0]), &h2o(), &[], &[]).unwrap();
        assert_eq!(outcome.current_neg_freqs_trshed, vec![-123.46]);
    }
}
