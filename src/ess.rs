//! Vocabulary shared by every troubleshooting component.
//!
//! This module defines the electronic structure software (ESS) supported by the
//! crate, the job types a workflow submits, and the level of theory a job runs at:
//!
//! - [`Software`]: Gaussian, QChem, Orca, Molpro and TeraChem
//! - [`JobType`]: the kind of job (optimization, frequencies, rotor scan, ...)
//! - [`LevelOfTheory`]: method and optional basis set
//!
//! It also provides [`determine_ess`], which identifies the software that wrote a
//! log file from its banner lines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when a software or job type name cannot be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EssError {
    /// The software name does not match any supported ESS
    #[error("Unknown ESS: {0}")]
    UnknownSoftware(String),
    /// The job type name does not match any known job type
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
}

/// Supported electronic structure software.
///
/// | Software | Log grammar | Remedy chain |
/// |----------|-------------|--------------|
/// | `Gaussian` | link-based termination codes | 13 remedies |
/// | `QChem` | two-stage optimization completion | 7 remedies |
/// | `Orca` | SCF divergence check, MaxCore parsing | memory / cpu |
/// | `Molpro` | memory in Mwords, basis library | 7 remedies |
/// | `TeraChem` | simple markers | none |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Software {
    /// Gaussian (g03, g09, g16)
    Gaussian,
    /// Q-Chem
    QChem,
    /// ORCA
    Orca,
    /// Molpro
    Molpro,
    /// TeraChem
    TeraChem,
}

impl Software {
    /// All supported software, in the order used for log detection.
    pub const ALL: [Software; 5] = [
        Software::Gaussian,
        Software::QChem,
        Software::Orca,
        Software::Molpro,
        Software::TeraChem,
    ];

    /// Lowercase identifier, as used in settings and remedy tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Software::Gaussian => "gaussian",
            Software::QChem => "qchem",
            Software::Orca => "orca",
            Software::Molpro => "molpro",
            Software::TeraChem => "terachem",
        }
    }

    /// Display name used in human-readable messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Software::Gaussian => "Gaussian",
            Software::QChem => "QChem",
            Software::Orca => "Orca",
            Software::Molpro => "Molpro",
            Software::TeraChem => "TeraChem",
        }
    }
}

impl fmt::Display for Software {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Software {
    type Err = EssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gaussian" | "g03" | "g09" | "g16" => Ok(Software::Gaussian),
            "qchem" | "q-chem" => Ok(Software::QChem),
            "orca" => Ok(Software::Orca),
            "molpro" => Ok(Software::Molpro),
            "terachem" => Ok(Software::TeraChem),
            _ => Err(EssError::UnknownSoftware(s.to_string())),
        }
    }
}

/// The type of an ESS job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Conformer optimization at a cheap level
    Conformer,
    /// Geometry optimization
    Opt,
    /// Optimization followed by frequencies in the same job
    Optfreq,
    /// Frequency (Hessian) calculation
    Freq,
    /// Single point energy
    Sp,
    /// Composite method job (e.g., CBS-QB3)
    Composite,
    /// Rotor scan
    Scan,
    /// Directed (constrained) scan
    DirectedScan,
    /// Intrinsic reaction coordinate
    Irc,
    /// Transition state search
    Ts,
    /// Orbital generation
    Orbitals,
    /// Bond dissociation energy job
    Bde,
}

impl JobType {
    /// Lowercase identifier used in messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Conformer => "conformer",
            JobType::Opt => "opt",
            JobType::Optfreq => "optfreq",
            JobType::Freq => "freq",
            JobType::Sp => "sp",
            JobType::Composite => "composite",
            JobType::Scan => "scan",
            JobType::DirectedScan => "directed_scan",
            JobType::Irc => "irc",
            JobType::Ts => "ts",
            JobType::Orbitals => "orbitals",
            JobType::Bde => "bde",
        }
    }

    /// Whether the job runs a geometry optimization whose cycle limit can be hit.
    pub fn is_optimization(&self) -> bool {
        matches!(
            self,
            JobType::Opt | JobType::Optfreq | JobType::Conformer | JobType::Ts
        )
    }

    /// Whether the job is a (directed) rotor scan.
    pub fn is_scan(&self) -> bool {
        matches!(self, JobType::Scan | JobType::DirectedScan)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = EssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let job_type = match s.trim().to_lowercase().as_str() {
            "conformer" => JobType::Conformer,
            "opt" => JobType::Opt,
            "optfreq" => JobType::Optfreq,
            "freq" => JobType::Freq,
            "sp" => JobType::Sp,
            "composite" => JobType::Composite,
            "scan" => JobType::Scan,
            "directed_scan" => JobType::DirectedScan,
            "irc" => JobType::Irc,
            "ts" => JobType::Ts,
            "orbitals" => JobType::Orbitals,
            "bde" => JobType::Bde,
            _ => return Err(EssError::UnknownJobType(s.to_string())),
        };
        Ok(job_type)
    }
}

/// Method and basis set of a job.
///
/// Composite methods such as CBS-QB3 carry no basis set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelOfTheory {
    /// Method, lowercase (e.g., "b3lyp", "ccsd(t)-f12", "cbs-qb3")
    pub method: String,
    /// Basis set, lowercase (e.g., "6-311++g(d,p)")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
}

impl LevelOfTheory {
    /// Creates a level of theory with a basis set.
    pub fn new(method: &str, basis: &str) -> Self {
        Self {
            method: method.to_lowercase(),
            basis: Some(basis.to_lowercase()),
        }
    }

    /// Creates a level of theory for a composite method (no basis set).
    pub fn composite(method: &str) -> Self {
        Self {
            method: method.to_lowercase(),
            basis: None,
        }
    }
}

impl fmt::Display for LevelOfTheory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.basis {
            Some(basis) => write!(f, "{}/{}", self.method, basis),
            None => f.write_str(&self.method),
        }
    }
}

/// Identifies the ESS that wrote a log from its content.
///
/// Lines are inspected from the top; the first line naming a supported software
/// decides. Returns `None` if no software is named anywhere in the log.
///
/// # Examples
///
/// ```
/// use esstrsh::ess::{determine_ess, Software};
///
/// let log = " Entering Gaussian System, Link 0=g16\n Initial command:\n";
/// assert_eq!(determine_ess(log), Some(Software::Gaussian));
/// ```
pub fn determine_ess(content: &str) -> Option<Software> {
    for line in content.lines() {
        let lower = line.to_lowercase();
        if lower.contains("gaussian") {
            return Some(Software::Gaussian);
        }
        if lower.contains("qchem") || lower.contains("q-chem") {
            return Some(Software::QChem);
        }
        if lower.contains("molpro") {
            return Some(Software::Molpro);
        }
        if lower.contains("o   r   c   a") || lower.contains("orca") {
            return Some(Software::Orca);
        }
        if lower.contains("terachem") {
            return Some(Software::TeraChem);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_from_str_is_case_insensitive() {
        assert_eq!("Gaussian".parse::<Software>().unwrap(), Software::Gaussian);
        assert_eq!("QCHEM".parse::<Software>().unwrap(), Software::QChem);
        assert_eq!("q-chem".parse::<Software>().unwrap(), Software::QChem);
        assert!("psi4".parse::<Software>().is_err());
    }

    #[test]
    fn test_job_type_classes() {
        assert!(JobType::Optfreq.is_optimization());
        assert!(JobType::Ts.is_optimization());
        assert!(!JobType::Freq.is_optimization());
        assert!(JobType::DirectedScan.is_scan());
        assert!(!JobType::Composite.is_scan());
    }

    #[test]
    fn test_level_of_theory_display() {
        assert_eq!(
            LevelOfTheory::new("wB97X-D3", "def2-TZVP").to_string(),
            "wb97x-d3/def2-tzvp"
        );
        assert_eq!(LevelOfTheory::composite("CBS-QB3").to_string(), "cbs-qb3");
    }

    #[test]
    fn test_determine_ess_from_banners() {
        assert_eq!(
            determine_ess("                  * O   R   C   A *\n"),
            Some(Software::Orca)
        );
        assert_eq!(
            determine_ess(" Welcome to Q-Chem\n A Quantum Leap Into The Future\n"),
            Some(Software::QChem)
        );
        assert_eq!(
            determine_ess(" ***  PROGRAM SYSTEM MOLPRO  ***\n"),
            Some(Software::Molpro)
        );
        assert_eq!(determine_ess("nothing to see here\n"), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&JobType::DirectedScan).unwrap();
        assert_eq!(json, "\"directed_scan\"");
        let sw: Software = serde_json::from_str("\"terachem\"").unwrap();
        assert_eq!(sw, Software::TeraChem);
    }
}
