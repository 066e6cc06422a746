use esstrsh::freq::trsh_negative_freq;
use esstrsh::geometry::Geometry;
use esstrsh::parser::{FrequencySource, GaussianFrequencySource, NormalModes, ParseError};
use esstrsh::scan::{scan_quality_check, ScanAction, ScanCheck, WellCounter};
use esstrsh::settings::ScanThresholds;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const WATER_TS_FREQ: &str = "\
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
                      1                      2
                      A1                     A1
 Frequencies --   -412.8011              3800.3159
 Red. masses --      1.0829                 1.0454
  Atom  AN      X      Y      Z        X      Y      Z
     1   8     0.00   0.00   0.07     0.00   0.00  -0.05
     2   1     0.00  -0.42  -0.56     0.00   0.59   0.40
     3   1     0.00   0.42  -0.56     0.00  -0.59   0.40

 -------------------
 - Thermochemistry -
 -------------------
 Normal termination of Gaussian 16 at Fri Nov  8 11:16:56 2019.
";

#[test]
fn test_negative_frequency_from_gaussian_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("output.log");
    fs::write(&path, WATER_TS_FREQ).unwrap();

    let outcome = trsh_negative_freq("H2O", &path, &[], &[], &GaussianFrequencySource).unwrap();
    assert_eq!(outcome.current_neg_freqs_trshed, vec![-412.8]);
    assert_eq!(outcome.conformers.len(), 2);
    let plus = outcome.conformers[0].get_atom_coords(0);
    let minus = outcome.conformers[1].get_atom_coords(0);
    assert!((plus[2] - (0.119262 + 1.1 * 0.07)).abs() < 1e-9);
    assert!((minus[2] - (0.119262 - 1.1 * 0.07)).abs() < 1e-9);
    assert!(outcome.errors.is_empty());
}

struct OrcaSource;

impl FrequencySource for OrcaSource {
    fn parse_normal_modes(&self, _path: &Path) -> Result<NormalModes, ParseError> {
        Err(ParseError::Unsupported {
            what: "normal displacement modes".to_string(),
            software: "Orca".to_string(),
        })
    }

    fn parse_geometry(&self, _path: &Path) -> Result<Geometry, ParseError> {
        Err(ParseError::Missing("geometry".to_string()))
    }
}

#[test]
fn test_unsupported_source_gives_empty_outcome() {
    let outcome = trsh_negative_freq("H2O", Path::new("output.out"), &[], &[], &OrcaSource).unwrap();
    assert!(outcome.conformers.is_empty());
    assert!(outcome.current_neg_freqs_trshed.is_empty());
}

#[test]
fn test_scan_request_from_json() {
    let json = r#"{
        "label": "CH3OH",
        "pivots": [0, 1],
        "energies": [0.0, 5.0, 10.0, 5.0, 12.0],
        "scan_res": 8.0,
        "used_methods": [["inc_res"]],
        "trajectory": []
    }"#;
    let check: ScanCheck = serde_json::from_str(json).unwrap();
    let verdict = scan_quality_check(&check, &ScanThresholds::default(), &WellCounter::default(), None);
    assert!(verdict.invalidate);
    assert_eq!(verdict.actions, vec![ScanAction::IncRes, ScanAction::Freeze]);
}
