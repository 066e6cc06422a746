//! Parsers for ESS output files.
//!
//! The troubleshooters need a handful of values from finished logs:
//!
//! - vibrational frequencies (Gaussian, QChem)
//! - normal displacement modes (Gaussian)
//! - the final Cartesian geometry (Gaussian "Standard orientation" blocks)
//! - the T1 diagnostic (Molpro)
//!
//! [`FrequencySource`] bundles the first three behind a trait so the
//! negative-frequency troubleshooter can run against any output format;
//! [`GaussianFrequencySource`] is the implementation for Gaussian logs.

use crate::ess::Software;
use crate::geometry::Geometry;
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while extracting data from an output file.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The output file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The requested data cannot be parsed from this software's output
    #[error("Parsing {what} is not supported for {software}")]
    Unsupported {
        /// What was requested
        what: String,
        /// Software that wrote the output
        software: String,
    },
    /// The output does not contain the requested data
    #[error("Could not find {0} in the output file")]
    Missing(String),
    /// A value in the output is not a valid number
    #[error("Could not parse number from '{0}'")]
    Number(String),
}

/// Result type for parsing operations
pub type Result<T> = std::result::Result<T, ParseError>;

/// Frequencies and their Cartesian displacement vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalModes {
    /// Frequencies in cm^-1, imaginary ones negative, in output order
    pub frequencies: Vec<f64>,
    /// One displacement per frequency, one `[dx, dy, dz]` per atom
    pub displacements: Vec<Vec<[f64; 3]>>,
}

/// Source of normal modes and geometries for the negative-frequency troubleshooter.
pub trait FrequencySource {
    /// Parses frequencies and normal displacement modes from a frequency job log.
    fn parse_normal_modes(&self, path: &Path) -> Result<NormalModes>;

    /// Parses the final geometry from the same log.
    fn parse_geometry(&self, path: &Path) -> Result<Geometry>;
}

/// [`FrequencySource`] for Gaussian output files.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianFrequencySource;

impl FrequencySource for GaussianFrequencySource {
    fn parse_normal_modes(&self, path: &Path) -> Result<NormalModes> {
        let content = fs::read_to_string(path)?;
        parse_normal_displacement_modes(&content)
    }

    fn parse_geometry(&self, path: &Path) -> Result<Geometry> {
        let content = fs::read_to_string(path)?;
        parse_geometry(&content)
    }
}

lazy_static! {
    static ref FLOAT_RE: String = r"[-+]?(?:\d+\.\d*|\.\d+)(?:[eE][-+]?\d+)?".to_string();

    // Orientation line: "      1          6           0        0.000000    0.000000    0.000000"
    static ref GEOM_RE: Regex = Regex::new(&format!(
        r"^\s*\d+\s+(\d+)\s+-?\d+\s+({0})\s+({0})\s+({0})\s*$",
        *FLOAT_RE
    )).unwrap();

    // Normal mode row: "     1   6     0.00   0.00   0.10     0.00   0.00  -0.05 ..."
    static ref MODE_ROW_RE: Regex = Regex::new(r"^\s*\d+\s+\d+(?:\s+[-+]?\d*\.\d+)+\s*$").unwrap();
}

const ELEMENT_SYMBOLS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S",
    "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga",
    "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd",
    "Ag", "Cd", "In", "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm",
    "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os",
    "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa",
    "U", "Np", "Pu", "Am", "Cm", "Bk", "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg",
    "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Converts an atomic number to its element symbol; unknown numbers give `"X"`.
pub fn atomic_number_to_symbol(num: usize) -> String {
    num.checked_sub(1)
        .and_then(|i| ELEMENT_SYMBOLS.get(i))
        .copied()
        .unwrap_or("X")
        .to_string()
}

/// Parses a single number, naming the offending token on failure.
fn parse_number(token: &str) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|_| ParseError::Number(token.to_string()))
}

/// Parses all vibrational frequencies in output order.
///
/// Gaussian prints them on `Frequencies --` lines, QChem on ` Frequency:` lines.
///
/// # Errors
///
/// Returns [`ParseError::Unsupported`] for other software and
/// [`ParseError::Missing`] if no frequency line is present.
pub fn parse_frequencies(content: &str, software: Software) -> Result<Vec<f64>> {
    let (marker, skip) = match software {
        Software::Gaussian => ("Frequencies --", 2),
        Software::QChem => (" Frequency:", 1),
        other => {
            return Err(ParseError::Unsupported {
                what: "frequencies".to_string(),
                software: other.display_name().to_string(),
            })
        }
    };
    let mut frequencies = Vec::new();
    for line in content.lines().filter(|l| l.contains(marker)) {
        for token in line.split_whitespace().skip(skip) {
            frequencies.push(parse_number(token)?);
        }
    }
    if frequencies.is_empty() {
        return Err(ParseError::Missing("frequencies".to_string()));
    }
    Ok(frequencies)
}

/// Parses frequencies and normal displacement modes from a Gaussian log.
///
/// Gaussian prints modes in blocks of up to three columns:
///
/// ```text
///  Frequencies --   -320.1234               210.5000               455.7000
///  Red. masses --      1.1000                 2.0000                 3.0000
///   Atom  AN      X      Y      Z        X      Y      Z        X      Y      Z
///      1   6     0.00   0.00   0.10     0.00   0.00  -0.05     0.10   0.00   0.00
/// ```
///
/// Only the first set of blocks is read; Gaussian repeats them for some job types.
pub fn parse_normal_displacement_modes(content: &str) -> Result<NormalModes> {
    let lines: Vec<&str> = content.lines().collect();
    let mut frequencies: Vec<f64> = Vec::new();
    let mut displacements: Vec<Vec<[f64; 3]>> = Vec::new();
    let mut block_freqs: Vec<f64> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.contains("Frequencies --") {
            block_freqs = line
                .split_whitespace()
                .skip(2)
                .map(parse_number)
                .collect::<Result<Vec<f64>>>()?;
            i += 1;
            continue;
        }
        if line.trim_start().starts_with("Atom  AN") && !block_freqs.is_empty() {
            let n_modes = block_freqs.len();
            let mut block: Vec<Vec<[f64; 3]>> = vec![Vec::new(); n_modes];
            i += 1;
            while i < lines.len() && MODE_ROW_RE.is_match(lines[i]) {
                let values = lines[i]
                    .split_whitespace()
                    .skip(2)
                    .map(parse_number)
                    .collect::<Result<Vec<f64>>>()?;
                if values.len() != n_modes * 3 {
                    return Err(ParseError::Number(lines[i].trim().to_string()));
                }
                for (mode, chunk) in values.chunks(3).enumerate() {
                    block[mode].push([chunk[0], chunk[1], chunk[2]]);
                }
                i += 1;
            }
            frequencies.append(&mut block_freqs);
            displacements.extend(block);
            continue;
        }
        if line.contains("- Thermochemistry -") && !frequencies.is_empty() {
            break;
        }
        i += 1;
    }
    if frequencies.is_empty() {
        return Err(ParseError::Missing("normal displacement modes".to_string()));
    }
    Ok(NormalModes {
        frequencies,
        displacements,
    })
}

/// Parses the last "Standard orientation" (or "Input orientation") geometry of a
/// Gaussian log.
pub fn parse_geometry(content: &str) -> Result<Geometry> {
    let mut elements: Vec<String> = Vec::new();
    let mut coords: Vec<f64> = Vec::new();
    let mut best: Option<(Vec<String>, Vec<f64>)> = None;
    let mut in_geom = false;
    for line in content.lines() {
        if line.contains("Standard orientation") || line.contains("Input orientation") {
            in_geom = true;
            elements.clear();
            coords.clear();
        } else if in_geom
            && (line.contains("Rotational constants") || line.contains("Distance matrix"))
        {
            in_geom = false;
            if !elements.is_empty() {
                best = Some((elements.clone(), coords.clone()));
            }
        } else if in_geom {
            if let Some(caps) = GEOM_RE.captures(line) {
                let atomic_num: usize = caps[1]
                    .parse()
                    .map_err(|_| ParseError::Number(caps[1].to_string()))?;
                elements.push(atomic_number_to_symbol(atomic_num));
                coords.push(parse_number(&caps[2])?);
                coords.push(parse_number(&caps[3])?);
                coords.push(parse_number(&caps[4])?);
            }
        }
    }
    if in_geom && !elements.is_empty() {
        best = Some((elements, coords));
    }
    let (elements, coords) = best.ok_or_else(|| ParseError::Missing("geometry".to_string()))?;
    Geometry::new(elements, coords).map_err(|e| ParseError::Missing(e.to_string()))
}

/// Parses the T1 diagnostic from a Molpro coupled-cluster log.
///
/// Returns the last value printed, or `None` when the log has none.
pub fn parse_t1(content: &str) -> Option<f64> {
    content
        .lines()
        .filter(|line| line.contains("T1 diagnostic:"))
        .filter_map(|line| line.split_whitespace().last())
        .filter_map(|token| token.parse::<f64>().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const GAUSSIAN_FREQ: &str = "\
 Entering Gaussian System, Link 0=g16
                         Standard orientation:
 ---------------------------------------------------------------------
 Center     Atomic      Atomic             Coordinates (Angstroms)
 Number     Number       Type             X           Y           Z
 ---------------------------------------------------------------------
      1          8           0        0.000000    0.000000    0.119262
      2          1           0        0.000000    0.763239   -0.477047
      3          1           0        0.000000   -0.763239   -0.477047
 ---------------------------------------------------------------------
 Rotational constants (GHZ):    919.1537406    408.2118078    282.6688870
 Harmonic frequencies (cm**-1), IR intensities (KM/Mole), Raman scattering
                      1                      2                      3
                      A1                     A1                     B2
 Frequencies --  -1635.4380              3800.3159              3912.1520
 Red. masses --      1.0829                 1.0454                 1.0809
 Frc consts  --      1.7065                 8.8946                 9.7473
 IR Inten    --     68.4810                 1.2981                18.5920
  Atom  AN      X      Y      Z        X      Y      Z        X      Y      Z
     1   8     0.00   0.00   0.07     0.00   0.00  -0.05     0.00   0.07   0.00
     2   1     0.00  -0.42  -0.56     0.00   0.59   0.40     0.00  -0.56   0.43
     3   1     0.00   0.42  -0.56     0.00  -0.59   0.40     0.00  -0.56  -0.43

 -------------------
 - Thermochemistry -
 -------------------
";

    #[test]
    fn test_atomic_number_to_symbol() {
        assert_eq!(atomic_number_to_symbol(1), "H");
        assert_eq!(atomic_number_to_symbol(26), "Fe");
        assert_eq!(atomic_number_to_symbol(118), "Og");
        assert_eq!(atomic_number_to_symbol(0), "X");
        assert_eq!(atomic_number_to_symbol(200), "X");
    }

    #[test]
    fn test_parse_gaussian_frequencies() {
        let freqs = parse_frequencies(GAUSSIAN_FREQ, Software::Gaussian).unwrap();
        assert_eq!(freqs, vec![-1635.4380, 3800.3159, 3912.1520]);
    }

    #[test]
    fn test_parse_qchem_frequencies() {
        let log = " Frequency:      -152.31     406.88    1100.12\n Frequency:      1500.00\n";
        let freqs = parse_frequencies(log, Software::QChem).unwrap();
        assert_eq!(freqs.len(), 4);
        assert_eq!(freqs[0], -152.31);
    }

    #[test]
    fn test_parse_frequencies_unsupported() {
        let result = parse_frequencies("anything", Software::Orca);
        assert!(matches!(result, Err(ParseError::Unsupported { .. })));
    }

    #[test]
    fn test_parse_normal_modes() {
        let modes = parse_normal_displacement_modes(GAUSSIAN_FREQ).unwrap();
        assert_eq!(modes.frequencies.len(), 3);
        assert_eq!(modes.displacements.len(), 3);
        assert_eq!(modes.displacements[0].len(), 3);
        assert_eq!(modes.displacements[0][1], [0.00, -0.42, -0.56]);
        assert_eq!(modes.displacements[2][2], [0.00, -0.56, -0.43]);
    }

    #[test]
    fn test_parse_geometry() {
        let geometry = parse_geometry(GAUSSIAN_FREQ).unwrap();
        assert_eq!(geometry.elements, vec!["O", "H", "H"]);
        assert_eq!(geometry.get_atom_coords(1), [0.0, 0.763239, -0.477047]);
    }

    #[test]
    fn test_gaussian_source_reads_files() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(GAUSSIAN_FREQ.as_bytes()).unwrap();
        let source = GaussianFrequencySource;
        let modes = source.parse_normal_modes(file.path()).unwrap();
        assert_eq!(modes.frequencies[0], -1635.4380);
        let geometry = source.parse_geometry(file.path()).unwrap();
        assert_eq!(geometry.num_atoms, 3);
    }

    #[test]
    fn test_parse_t1() {
        let log = " T1 diagnostic:  0.01023\n some line\n T1 diagnostic:  0.01150\n";
        assert_eq!(parse_t1(log), Some(0.01150));
        assert_eq!(parse_t1("no diagnostics"), None);
    }
}
