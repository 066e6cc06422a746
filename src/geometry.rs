//! Molecular geometry and the internal-coordinate math used by the troubleshooters.
//!
//! This module provides:
//!
//! - [`Geometry`]: element symbols plus flattened Cartesian coordinates
//! - [`evaluate_bond`], [`evaluate_dihedral`]: internal
//!   coordinates measured on a coordinate vector
//! - [`Geometry::displaced`]: a copy of the geometry moved along a normal mode
//!
//! All coordinates are in Angstroms. Atom indices are zero-based.

use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;

/// Errors raised when a geometry is built from inconsistent data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// The coordinate count does not match three per atom
    #[error("Expected {expected} coordinates for {atoms} atoms, got {found}")]
    CoordinateCount {
        /// Number of atoms
        atoms: usize,
        /// Expected coordinate count
        expected: usize,
        /// Actual coordinate count
        found: usize,
    },
    /// A displacement vector does not cover every atom
    #[error("Displacement covers {found} atoms but the geometry has {atoms}")]
    DisplacementSize {
        /// Number of atoms in the geometry
        atoms: usize,
        /// Number of atoms in the displacement
        found: usize,
    },
}

/// A molecular geometry with atomic elements and Cartesian coordinates.
///
/// Coordinates are stored flat, `[x1, y1, z1, x2, y2, z2, ...]`, in a `DVector<f64>`.
///
/// # Examples
///
/// ```
/// use esstrsh::geometry::Geometry;
///
/// let geometry = Geometry::new(
///     vec!["O".to_string(), "H".to_string(), "H".to_string()],
///     vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
/// )
/// .unwrap();
/// assert_eq!(geometry.num_atoms, 3);
/// assert_eq!(geometry.get_atom_coords(1), [0.757, 0.586, 0.0]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SerializableGeometry", into = "SerializableGeometry")]
pub struct Geometry {
    /// Chemical element symbols for each atom in order
    pub elements: Vec<String>,
    /// Flattened Cartesian coordinates in Angstroms
    pub coords: DVector<f64>,
    /// Number of atoms in the molecule
    pub num_atoms: usize,
}

/// Wire form of [`Geometry`]: one `[x, y, z]` triple per atom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableGeometry {
    /// Element symbols
    pub symbols: Vec<String>,
    /// Cartesian coordinates, one triple per atom
    pub coords: Vec<[f64; 3]>,
}

impl Geometry {
    /// Creates a geometry from element symbols and a flattened coordinate list.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::CoordinateCount`] if `coords.len() != 3 * elements.len()`.
    pub fn new(elements: Vec<String>, coords: Vec<f64>) -> Result<Self, GeometryError> {
        let num_atoms = elements.len();
        if coords.len() != num_atoms * 3 {
            return Err(GeometryError::CoordinateCount {
                atoms: num_atoms,
                expected: num_atoms * 3,
                found: coords.len(),
            });
        }
        Ok(Self {
            elements,
            coords: DVector::from_vec(coords),
            num_atoms,
        })
    }

    /// Returns the `[x, y, z]` position of atom `atom_idx`.
    pub fn get_atom_coords(&self, atom_idx: usize) -> [f64; 3] {
        let i = atom_idx * 3;
        [self.coords[i], self.coords[i + 1], self.coords[i + 2]]
    }

    /// Distance in Angstroms between atoms `a` and `b`.
    pub fn distance(&self, a: usize, b: usize) -> f64 {
        evaluate_bond(&self.coords, a, b)
    }

    /// Dihedral angle in degrees, in `[0, 360)`, defined by four atoms.
    pub fn dihedral(&self, a: usize, b: usize, c: usize, d: usize) -> f64 {
        evaluate_dihedral(&self.coords, a, b, c, d)
    }

    /// Returns a copy moved by `factor` times a per-atom displacement.
    ///
    /// Used to push a structure along an imaginary normal mode; a negative
    /// factor moves it the opposite way.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::DisplacementSize`] if the displacement does not
    /// have exactly one vector per atom.
    pub fn displaced(
        &self,
        displacement: &[[f64; 3]],
        factor: f64,
    ) -> Result<Geometry, GeometryError> {
        if displacement.len() != self.num_atoms {
            return Err(GeometryError::DisplacementSize {
                atoms: self.num_atoms,
                found: displacement.len(),
            });
        }
        let flat: Vec<f64> = displacement.iter().flat_map(|d| d.iter().copied()).collect();
        let coords = &self.coords + DVector::from_vec(flat) * factor;
        Ok(Geometry {
            elements: self.elements.clone(),
            coords,
            num_atoms: self.num_atoms,
        })
    }
}

impl fmt::Display for Geometry {
    /// Writes the geometry in XYZ body format (no atom-count header).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            let [x, y, z] = self.get_atom_coords(i);
            writeln!(f, "{:<3}{:>14.8}{:>14.8}{:>14.8}", element, x, y, z)?;
        }
        Ok(())
    }
}

impl TryFrom<SerializableGeometry> for Geometry {
    type Error = GeometryError;

    fn try_from(value: SerializableGeometry) -> Result<Self, Self::Error> {
        let coords = value.coords.iter().flat_map(|c| c.iter().copied()).collect();
        Geometry::new(value.symbols, coords)
    }
}

impl From<Geometry> for SerializableGeometry {
    fn from(geometry: Geometry) -> Self {
        let coords = (0..geometry.num_atoms)
            .map(|i| geometry.get_atom_coords(i))
            .collect();
        SerializableGeometry {
            symbols: geometry.elements,
            coords,
        }
    }
}

fn atom_position(coords: &DVector<f64>, atom: usize) -> Vector3<f64> {
    let i = atom * 3;
    Vector3::new(coords[i], coords[i + 1], coords[i + 2])
}

/// Distance between atoms `a` and `b` of a flattened coordinate vector.
pub fn evaluate_bond(coords: &DVector<f64>, a: usize, b: usize) -> f64 {
    (atom_position(coords, b) - atom_position(coords, a)).norm()
}

/// Dihedral angle a-b-c-d in degrees, normalized to `[0, 360)`.
///
/// Uses the `atan2` form, which stays well conditioned near 0 and 180 degrees.
pub fn evaluate_dihedral(coords: &DVector<f64>, a: usize, b: usize, c: usize, d: usize) -> f64 {
    let b1 = atom_position(coords, b) - atom_position(coords, a);
    let b2 = atom_position(coords, c) - atom_position(coords, b);
    let b3 = atom_position(coords, d) - atom_position(coords, c);

    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let m1 = n1.cross(&b2.normalize());

    let x = n1.dot(&n2);
    let y = m1.dot(&n2);
    let angle = y.atan2(x).to_degrees();
    let normalized = angle.rem_euclid(360.0);
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water() -> Geometry {
        Geometry::new(
            vec!["O".to_string(), "H".to_string(), "H".to_string()],
            vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_inconsistent_coordinates() {
        let result = Geometry::new(vec!["H".to_string()], vec![0.0, 0.0]);
        assert!(matches!(
            result,
            Err(GeometryError::CoordinateCount { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn test_distance() {
        let geometry = water();
        let oh = geometry.distance(0, 1);
        assert!((oh - (0.757f64.powi(2) + 0.586f64.powi(2)).sqrt()).abs() < 1e-12);
        assert!((geometry.distance(1, 2) - 1.514).abs() < 1e-12);
    }

    #[test]
    fn test_displaced_moves_along_mode() {
        let geometry = water();
        let mode = [[0.0, 0.0, 0.1], [0.0, 0.0, -0.2], [0.0, 0.0, 0.0]];
        let plus = geometry.displaced(&mode, 1.1).unwrap();
        let minus = geometry.displaced(&mode, -1.1).unwrap();
        assert!((plus.get_atom_coords(0)[2] - 0.11).abs() < 1e-12);
        assert!((minus.get_atom_coords(1)[2] - 0.22).abs() < 1e-12);
        assert_eq!(plus.elements, geometry.elements);
    }

    #[test]
    fn test_displaced_rejects_wrong_size() {
        let geometry = water();
        assert!(geometry.displaced(&[[0.0; 3]], 1.0).is_err());
    }

    #[test]
    fn test_serde_uses_atom_triples() {
        let json = serde_json::to_value(water()).unwrap();
        assert_eq!(json["symbols"][0], "O");
        assert_eq!(json["coords"][1][0], 0.757);
        let back: Geometry = serde_json::from_value(json).unwrap();
        assert_eq!(back.num_atoms, 3);
    }

    #[test]
    fn test_display_is_xyz_body() {
        let text = water().to_string();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("O "));
    }
}
