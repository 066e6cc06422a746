//! Classification of finished ESS jobs from their output logs.
//!
//! [`determine_ess_status`] reads a log and returns a [`JobStatusVerdict`]: either
//! `Done`, or `Errored` with a list of [`ErrorKeyword`]s, a human-readable error
//! and the evidence line that triggered the classification.
//!
//! Every software has its own [`LogGrammar`]. A grammar walks the log backward
//! from the end, since failure messages sit near the bottom, and stops at the
//! first conclusive line.

use crate::ess::{determine_ess, JobType, Software};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Logs with fewer lines than this are treated as never written.
pub const MIN_LOG_LINES: usize = 5;

/// Errors raised while classifying a log.
#[derive(Error, Debug)]
pub enum StatusError {
    /// The log file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The ESS rejected the charge/multiplicity combination of the species
    #[error("The multiplicity and charge combination for species {0} are wrong.")]
    SpeciesDefinition(String),
    /// No software was given and none could be detected from the log
    #[error("Could not determine the ESS that wrote {0}")]
    UnknownSoftware(String),
}

/// Result type for status operations
pub type Result<T> = std::result::Result<T, StatusError>;

/// Structured error tags attached to an errored verdict.
///
/// Serialized with the spelling the troubleshooting rules match on.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKeyword {
    NoOutput,
    Unconverged,
    GL9999,
    InputError,
    GL101,
    InternalCoordinateError,
    GL103,
    GL108,
    OptOrientation,
    GL202,
    GL301,
    GL401,
    SCF,
    GL502,
    ZMat,
    GL716,
    MP2,
    GL906,
    MaxOptCycles,
    GL913,
    CheckFile,
    BasisSet,
    DiskSpace,
    Memory,
    Scratch,
    Syntax,
    DIIS,
    MDCI,
    #[serde(rename = "cpu")]
    Cpu,
    Input,
    Basis,
    Convergence,
    IncorrectMethod,
    MissingBasisSet,
    #[serde(rename = "max_total_job_memory")]
    MaxTotalJobMemory,
    Unknown,
}

impl fmt::Display for ErrorKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKeyword::Cpu => f.write_str("cpu"),
            ErrorKeyword::MaxTotalJobMemory => f.write_str("max_total_job_memory"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The job terminated normally
    Done,
    /// The job failed
    Errored,
}

/// Classification of one output log.
///
/// A `Done` verdict never carries keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusVerdict {
    /// Done or errored
    pub status: JobStatus,
    /// Error tags, empty when done
    #[serde(default)]
    pub keywords: Vec<ErrorKeyword>,
    /// Human-readable error description, empty when done
    #[serde(default)]
    pub error: String,
    /// The log line that triggered the classification, possibly empty
    #[serde(default)]
    pub line: String,
}

impl JobStatusVerdict {
    /// A verdict for a normally terminated job.
    pub fn done() -> Self {
        Self {
            status: JobStatus::Done,
            keywords: Vec::new(),
            error: String::new(),
            line: String::new(),
        }
    }

    /// A verdict for a failed job.
    pub fn errored(keywords: Vec<ErrorKeyword>, error: impl Into<String>, line: &str) -> Self {
        Self {
            status: JobStatus::Errored,
            keywords,
            error: error.into(),
            line: line.trim_end().to_string(),
        }
    }

    /// Whether the job terminated normally.
    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    /// Whether `keyword` is among the error tags.
    pub fn has_keyword(&self, keyword: ErrorKeyword) -> bool {
        self.keywords.contains(&keyword)
    }
}

/// Log grammar of one ESS.
pub trait LogGrammar {
    /// The software this grammar reads.
    fn software(&self) -> Software;

    /// Classifies a log already split into lines.
    ///
    /// `lines` always has at least [`MIN_LOG_LINES`] entries.
    fn classify(&self, lines: &[&str], species_label: &str, job_type: JobType)
        -> Result<JobStatusVerdict>;
}

/// Returns the grammar for `software`.
pub fn grammar_for(software: Software) -> &'static dyn LogGrammar {
    match software {
        Software::Gaussian => &GaussianGrammar,
        Software::QChem => &QChemGrammar,
        Software::Orca => &OrcaGrammar,
        Software::Molpro => &MolproGrammar,
        Software::TeraChem => &TeraChemGrammar,
    }
}

fn no_output() -> JobStatusVerdict {
    JobStatusVerdict::errored(
        vec![ErrorKeyword::NoOutput],
        "Log file could not be read",
        "",
    )
}

fn unknown_failure(software: Software, line: &str) -> JobStatusVerdict {
    JobStatusVerdict::errored(
        vec![ErrorKeyword::Unknown],
        format!(
            "{} job terminated for an unknown reason.",
            software.display_name()
        ),
        line,
    )
}

/// Classifies log text produced by `software`.
///
/// # Errors
///
/// Returns [`StatusError::SpeciesDefinition`] when the ESS rejected the species'
/// charge and multiplicity.
///
/// # Examples
///
/// ```
/// use esstrsh::ess::{JobType, Software};
/// use esstrsh::status::{classify, ErrorKeyword};
///
/// let log = "x\nx\nx\nx\n Error termination via Lnk1e in /g16/l9999.exe at Mon\n";
/// let verdict = classify(log, "CH4", JobType::Opt, Software::Gaussian).unwrap();
/// assert_eq!(verdict.keywords, vec![ErrorKeyword::Unconverged, ErrorKeyword::GL9999]);
/// ```
pub fn classify(
    content: &str,
    species_label: &str,
    job_type: JobType,
    software: Software,
) -> Result<JobStatusVerdict> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() < MIN_LOG_LINES {
        return Ok(no_output());
    }
    let verdict = grammar_for(software).classify(&lines, species_label, job_type)?;
    if verdict.is_done() {
        debug!("{} job of {} terminated normally", software.display_name(), species_label);
    } else {
        warn!(
            "{} job of {} errored: {:?}, {}",
            software.display_name(),
            species_label,
            verdict.keywords,
            verdict.error
        );
    }
    Ok(verdict)
}

/// Reads a log file and classifies it.
///
/// When `software` is `None` it is detected from the log content. An unreadable
/// or short log yields a `NoOutput` verdict rather than an error.
pub fn determine_ess_status(
    path: &Path,
    species_label: &str,
    job_type: JobType,
    software: Option<Software>,
) -> Result<JobStatusVerdict> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Could not read log {}: {}", path.display(), e);
            return Ok(no_output());
        }
    };
    if content.lines().count() < MIN_LOG_LINES {
        return Ok(no_output());
    }
    let software = match software {
        Some(software) => software,
        None => determine_ess(&content)
            .ok_or_else(|| StatusError::UnknownSoftware(path.display().to_string()))?,
    };
    classify(&content, species_label, job_type, software)
}

/// Gaussian: link-coded termination messages.
pub struct GaussianGrammar;

struct Hit {
    keywords: Vec<ErrorKeyword>,
    error: String,
    line: String,
}

/// Failing link, its keywords and the message reported for it.
const GAUSSIAN_LINKS: [(&str, &[ErrorKeyword], &str); 11] = [
    ("l9999.exe", &[ErrorKeyword::Unconverged, ErrorKeyword::GL9999], "Unconverged"),
    (
        "l101.exe",
        &[ErrorKeyword::InputError, ErrorKeyword::GL101],
        "The blank line after the coordinate section is missing, or charge/multiplicity was not specified correctly.",
    ),
    (
        "l103.exe",
        &[ErrorKeyword::InternalCoordinateError, ErrorKeyword::GL103],
        "Internal coordinate error",
    ),
    (
        "l108.exe",
        &[ErrorKeyword::InputError, ErrorKeyword::GL108],
        "There are two blank lines between z-matrix and the variables, expected only one.",
    ),
    (
        "l202.exe",
        &[ErrorKeyword::OptOrientation, ErrorKeyword::GL202],
        "During the optimization process, either the standard orientation or the point group of the molecule has changed.",
    ),
    ("l301.exe", &[ErrorKeyword::GL301], ""),
    ("l401.exe", &[ErrorKeyword::GL401], ""),
    ("l502.exe", &[ErrorKeyword::SCF, ErrorKeyword::GL502], "Unconverged SCF."),
    (
        "l716.exe",
        &[ErrorKeyword::ZMat, ErrorKeyword::GL716],
        "Angle in z-matrix outside the allowed range 0 < x < 180.",
    ),
    (
        "l906.exe",
        &[ErrorKeyword::MP2, ErrorKeyword::GL906],
        "The MP2 calculation has failed. It may be related to pseudopotential basis sets used with polarization functions that do not exist.",
    ),
    (
        "l913.exe",
        &[ErrorKeyword::MaxOptCycles, ErrorKeyword::GL913],
        "Maximum optimization cycles reached.",
    ),
];

impl GaussianGrammar {
    /// Examines one line; `previous` is the line printed just before it.
    fn match_line(line: &str, previous: Option<&str>) -> Option<Hit> {
        use ErrorKeyword::*;
        let mut keywords: Vec<ErrorKeyword> = Vec::new();
        let mut error = String::new();
        let mut evidence = line.to_string();

        if line.contains("termination") {
            let link = if line.contains("link 9999") {
                GAUSSIAN_LINKS.first()
            } else {
                GAUSSIAN_LINKS.iter().find(|(name, _, _)| line.contains(*name))
            };
            if let Some((_, link_keywords, message)) = link {
                keywords = link_keywords.to_vec();
                error = message.to_string();
            }
            if keywords.contains(&GL301) || keywords.contains(&GL401) {
                let previous = previous.unwrap_or("");
                if previous.contains("No data on chk file")
                    || previous.contains("Basis set data is not on the checkpoint file")
                {
                    keywords = vec![CheckFile];
                    error = previous.trim().to_string();
                } else if keywords.contains(&GL301) {
                    if previous.contains("Atomic number out of range for") {
                        let basis = previous.split_whitespace().nth(6).unwrap_or(previous.trim());
                        error = format!(
                            "The basis set {} is not appropriate for this chemistry.",
                            basis
                        );
                        keywords.push(BasisSet);
                    } else {
                        error = "Either charge, multiplicity, or basis set was not specified correctly. Alternatively, a specified atom does not match any standard atomic symbol."
                            .to_string();
                        keywords.push(InputError);
                    }
                } else {
                    error = "The projection from the old to the new basis set has failed."
                        .to_string();
                    keywords.push(BasisSet);
                }
            }
        } else if line.contains("Erroneous write") || line.contains("Write error in NtrExt1") {
            keywords = vec![DiskSpace];
            error = "Ran out of disk space.".to_string();
            evidence.clear();
        } else if line.contains("NtrErr") {
            keywords = vec![CheckFile];
            error = "An operation on the check file was specified, but a .chk was not found or is incomplete."
                .to_string();
            evidence.clear();
        } else if line.contains("malloc failed") || line.contains("galloc") {
            keywords = vec![Memory];
            error = "Memory allocation failed (did you ask for too much?)".to_string();
            evidence.clear();
        } else if line.contains("PGFIO/stdio: No such file or directory") {
            keywords = vec![Scratch];
            error = "Wrongly specified the scratch directory. GAUSS_SCRDIR in the submit script should point to an existing directory."
                .to_string();
            evidence.clear();
        }

        if line.to_lowercase().contains("a syntax error was detected") {
            keywords = vec![Syntax];
            error = "There was a syntax error in the Gaussian input file. Check your Gaussian input file template."
                .to_string();
            evidence.clear();
        }

        if keywords.is_empty() {
            return None;
        }
        if error.is_empty() {
            error = "Gaussian job terminated for an unknown reason. It is possible there was a server node failure."
                .to_string();
        }
        Some(Hit {
            keywords,
            error,
            line: evidence,
        })
    }
}

impl LogGrammar for GaussianGrammar {
    fn software(&self) -> Software {
        Software::Gaussian
    }

    fn classify(&self, lines: &[&str], _label: &str, _job_type: JobType) -> Result<JobStatusVerdict> {
        if lines.iter().rev().take(19).any(|l| l.contains("Normal termination")) {
            return Ok(JobStatusVerdict::done());
        }
        let hit = (0..lines.len()).rev().find_map(|i| {
            let previous = i.checked_sub(1).map(|p| lines[p]);
            Self::match_line(lines[i], previous)
        });
        Ok(match hit {
            Some(hit) => JobStatusVerdict::errored(hit.keywords, hit.error, &hit.line),
            None => JobStatusVerdict::errored(
                vec![ErrorKeyword::Unknown],
                "Gaussian job terminated for an unknown reason. It is possible there was a server node failure.",
                "",
            ),
        })
    }
}

/// QChem: completion banner plus, for optimizations, a convergence confirmation.
pub struct QChemGrammar;

impl LogGrammar for QChemGrammar {
    fn software(&self) -> Software {
        Software::QChem
    }

    fn classify(&self, lines: &[&str], label: &str, job_type: JobType) -> Result<JobStatusVerdict> {
        let optimization = job_type.is_optimization();
        let mut done = false;
        for line in lines.iter().rev() {
            if line.contains("Thank you very much for using Q-Chem") {
                done = true;
                if !optimization {
                    break;
                }
                continue;
            }
            if optimization {
                if line.contains("MAXIMUM OPTIMIZATION CYCLES REACHED") {
                    return Ok(JobStatusVerdict::errored(
                        vec![ErrorKeyword::MaxOptCycles],
                        "Maximum optimization cycles reached.",
                        line,
                    ));
                }
                if line.contains("OPTIMIZATION CONVERGED") && done {
                    break;
                }
            }
            // Past a completion banner only the cycle limit can overturn it.
            if done {
                continue;
            }
            if line.contains("SCF failed") {
                return Ok(JobStatusVerdict::errored(
                    vec![ErrorKeyword::SCF],
                    "SCF failed",
                    line,
                ));
            }
            if line.contains("error") && !line.contains("DIIS") {
                return Ok(JobStatusVerdict::errored(
                    vec![ErrorKeyword::SCF, ErrorKeyword::DIIS],
                    "SCF failed",
                    line,
                ));
            }
            if line.contains("Invalid charge/multiplicity combination") {
                return Err(StatusError::SpeciesDefinition(label.to_string()));
            }
        }
        if done {
            Ok(JobStatusVerdict::done())
        } else {
            Ok(unknown_failure(Software::QChem, ""))
        }
    }
}

/// Orca: error terminations by module, plus an SCF divergence check on success.
pub struct OrcaGrammar;

impl OrcaGrammar {
    /// Energy after the first SCF iteration and the final SCF energy.
    fn scf_energies(lines: &[&str]) -> Option<(f64, f64)> {
        let mut initial: Option<f64> = None;
        for (i, line) in lines.iter().enumerate() {
            if line.contains("Starting incremental Fock matrix formation") && initial.is_none() {
                initial = lines
                    .get(i + 1)
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|t| t.parse().ok());
            } else if line.contains("TOTAL SCF ENERGY") {
                let last = lines
                    .get(i + 3)
                    .and_then(|l| l.split_whitespace().nth(3))
                    .and_then(|t| t.parse::<f64>().ok());
                return initial.zip(last);
            }
        }
        None
    }

    /// The last per-core MaxCore request of an SCF failure, with the error line
    /// three lines above it as evidence.
    fn last_max_core_request(lines: &[&str]) -> Option<(String, String)> {
        let idx = lines.iter().rposition(|l| l.contains("Please increase MaxCore"))?;
        let tokens: Vec<&str> = lines[idx].split_whitespace().collect();
        let value = tokens.len().checked_sub(2).map(|i| tokens[i].to_string())?;
        let evidence = lines[idx.checked_sub(3).unwrap_or(idx)].trim_end().to_string();
        Some((value, evidence))
    }

    /// Largest per-core MaxCore request, in MB, among all lines.
    fn max_core_request(lines: &[&str]) -> Option<(f64, String)> {
        lines
            .iter()
            .filter(|l| l.contains("Please increase MaxCore"))
            .filter_map(|l| {
                let tokens: Vec<&str> = l.split_whitespace().collect();
                let value = tokens.len().checked_sub(2).and_then(|i| {
                    tokens[i].trim_matches(|c| c == '(' || c == ')').parse::<f64>().ok()
                })?;
                Some((value.ceil(), l.trim_end().to_string()))
            })
            .fold(None, |best: Option<(f64, String)>, item| match best {
                Some(b) if b.0 >= item.0 => Some(b),
                _ => Some(item),
            })
    }
}

impl LogGrammar for OrcaGrammar {
    fn software(&self) -> Software {
        Software::Orca
    }

    fn classify(&self, lines: &[&str], _label: &str, _job_type: JobType) -> Result<JobStatusVerdict> {
        use ErrorKeyword::*;
        let n = lines.len();
        for i in (0..n).rev() {
            let line = lines[i];
            if line.contains("ORCA TERMINATED NORMALLY") {
                if let Some((initial, last)) = Self::scf_energies(lines) {
                    let ratio = last / initial;
                    if ratio > 2.0 {
                        return Ok(JobStatusVerdict::errored(
                            vec![SCF],
                            format!(
                                "The SCF energy diverged: the final energy ({}) is {:.2} times the energy after the first iteration ({}).",
                                last, ratio, initial
                            ),
                            "",
                        ));
                    }
                }
                return Ok(JobStatusVerdict::done());
            }
            if line.contains("ORCA finished by error termination in SCF") {
                if let Some((mb, evidence)) = Self::last_max_core_request(lines) {
                    return Ok(JobStatusVerdict::errored(
                        vec![SCF, Memory],
                        format!("Orca suggests to increase per cpu core memory to {} MB.", mb),
                        &evidence,
                    ));
                }
                return Ok(JobStatusVerdict::errored(vec![SCF], "SCF error in Orca.", line));
            }
            if line.contains("ORCA finished by error termination in MDCI") {
                if let Some((mb, evidence)) = Self::max_core_request(lines) {
                    return Ok(JobStatusVerdict::errored(
                        vec![MDCI, Memory],
                        format!("Orca suggests to increase per cpu core memory to {} MB.", mb),
                        &evidence,
                    ));
                }
                if let Some(pairs_line) = lines
                    .iter()
                    .rev()
                    .find(|l| l.contains("parallel calculation exceeds number of pairs"))
                {
                    let max_core = pairs_line
                        .split_whitespace()
                        .last()
                        .unwrap_or("")
                        .trim_matches(|c| c == '(' || c == ')');
                    return Ok(JobStatusVerdict::errored(
                        vec![MDCI, Cpu],
                        format!(
                            "Orca cannot utilize cpu cores more than electron pairs in a molecule. The maximum number of cpu cores can be used for this job is {}.",
                            max_core
                        ),
                        pairs_line,
                    ));
                }
                return Ok(JobStatusVerdict::errored(vec![MDCI], "MDCI error in Orca.", line));
            }
            if line.contains("Error : multiplicity") {
                return Ok(JobStatusVerdict::errored(
                    vec![Input],
                    format!("The multiplicity and charge combination is wrong: {}", line.trim()),
                    line,
                ));
            }
            if line.contains("UNRECOGNIZED OR DUPLICATED KEYWORD") {
                let following = lines.get(i + 1).copied().unwrap_or("");
                let keyword = following.split_whitespace().next().unwrap_or("");
                return Ok(JobStatusVerdict::errored(
                    vec![Syntax],
                    format!("There was keyword syntax error in the Orca input file. In particular, keywords {} can either be duplicated or illegal. Please check your Orca input file template.", keyword),
                    following,
                ));
            }
            if line.contains("There are no CABS") {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                let atom = tokens
                    .len()
                    .checked_sub(2)
                    .map(|j| tokens[j].trim_matches(|c| c == '(' || c == ')'))
                    .unwrap_or("");
                return Ok(JobStatusVerdict::errored(
                    vec![Basis],
                    format!("Orca cannot find the CABS basis set for {}.", atom),
                    line,
                ));
            }
            if line.contains("This wavefunction IS NOT FULLY CONVERGED!") {
                return Ok(JobStatusVerdict::errored(
                    vec![Convergence],
                    "Specified wavefunction method is not converged. Please restart optimization or try a different convergence criterion.",
                    line,
                ));
            }
        }
        Ok(unknown_failure(Software::Orca, ""))
    }
}

/// Molpro: memory requests in Mwords and basis library errors.
pub struct MolproGrammar;

impl LogGrammar for MolproGrammar {
    fn software(&self) -> Software {
        Software::Molpro
    }

    fn classify(&self, lines: &[&str], _label: &str, _job_type: JobType) -> Result<JobStatusVerdict> {
        use ErrorKeyword::*;
        for line in lines.iter().rev() {
            let lower = line.to_lowercase();
            if lower.contains("molpro calculation terminated")
                || lower.contains("variable memory released")
            {
                return Ok(JobStatusVerdict::done());
            }
            if line.contains("No convergence") {
                return Ok(JobStatusVerdict::errored(vec![Unconverged], "Unconverged", line));
            }
            if line.contains("A further")
                && line.contains("Mwords of memory are needed")
                && line.contains("Increase memory to")
            {
                let mw = line.split_whitespace().nth(2).unwrap_or("0");
                return Ok(JobStatusVerdict::errored(
                    vec![Memory],
                    format!("Additional memory required: {} MW", mw),
                    line,
                ));
            }
            if line.contains("insufficient memory available - require") {
                let required = line
                    .split_whitespace()
                    .skip_while(|t| *t != "require")
                    .nth(1)
                    .and_then(|t| t.parse::<f64>().ok())
                    .unwrap_or(0.0);
                return Ok(JobStatusVerdict::errored(
                    vec![Memory],
                    format!("Additional memory required: {} MW", required / 1e6),
                    line,
                ));
            }
            if line.contains("Basis library exhausted") {
                let basis = lines
                    .iter()
                    .find(|l| l.contains("SETTING BASIS"))
                    .and_then(|l| l.split_whitespace().last())
                    .unwrap_or("");
                return Ok(JobStatusVerdict::errored(
                    vec![BasisSet],
                    format!("Unrecognized basis set {}", basis),
                    line,
                ));
            }
            if line.contains("the problem occurs") {
                return Ok(JobStatusVerdict::errored(vec![Unknown], "Unknown", line));
            }
        }
        Ok(unknown_failure(Software::Molpro, ""))
    }
}

/// TeraChem: plain markers.
pub struct TeraChemGrammar;

impl LogGrammar for TeraChemGrammar {
    fn software(&self) -> Software {
        Software::TeraChem
    }

    fn classify(&self, lines: &[&str], _label: &str, _job_type: JobType) -> Result<JobStatusVerdict> {
        use ErrorKeyword::*;
        for line in lines.iter().rev() {
            if line.contains("Job finished:") {
                return Ok(JobStatusVerdict::done());
            }
            let lower = line.to_lowercase();
            if lower.contains("incorrect method") {
                return Ok(JobStatusVerdict::errored(
                    vec![IncorrectMethod],
                    "incorrect method",
                    line,
                ));
            }
            if let Some(pos) = lower.find("error: ") {
                // Only the first word of the message after the ERROR tag.
                let message = line[pos..].split_whitespace().nth(1).unwrap_or("");
                return Ok(JobStatusVerdict::errored(vec![Unknown], message, line));
            }
            if lower.contains("unable to open file") && lower.contains("basis") {
                let basis = line
                    .trim()
                    .rsplit('/')
                    .next()
                    .unwrap_or("")
                    .replace('[', "(")
                    .replace(']', ")");
                return Ok(JobStatusVerdict::errored(
                    vec![MissingBasisSet],
                    format!("Could not find basis set {} in TeraChem", basis),
                    line,
                ));
            }
        }
        Ok(unknown_failure(Software::TeraChem, ""))
    }
}
