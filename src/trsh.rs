//! Troubleshooting of errored ESS jobs.
//!
//! Given a [`JobStatusVerdict`] and everything already tried for a job,
//! [`next_remedy`] picks the next remedy from an ordered per-software rule table.
//! A rule is a tag, a predicate over the failure, and the change it makes to the
//! job. The first rule whose predicate holds and whose tag is not yet in the
//! job's [`TrshHistory`] is applied; its tag is appended to the returned history.
//! Since every rule is tried at most once, repeated calls always end in an
//! exhausted decision.
//!
//! # Remedy chains
//!
//! | Software | Remedies, in order |
//! |----------|--------------------|
//! | Gaussian | remove checkpoint, cartesian opt, fine grid, four SCF variants, integral accuracy, CBS-QB3, memory, SCF + CBS-QB3, QChem, Molpro |
//! | QChem | max cycles, DIIS_GDM, SYM_IGNORE, wB97X-D3/def2-TZVP, B3LYP/6-311++G(d,p), Gaussian, Molpro |
//! | Orca | memory per core, fewer cores for memory, fewer cores than electron pairs |
//! | Molpro | memory, level shift, vdz, vdz + shift, whole node memory, Gaussian, QChem |
//! | TeraChem | none |
//!
//! The module also troubleshoots rotor scans ([`trsh_scan_job`]) and conformers
//! that changed their connectivity ([`trsh_conformer_isomorphism`]).

use crate::ess::{JobType, LevelOfTheory, Software};
use crate::scan::ScanAction;
use crate::settings::ServerConfig;
use crate::status::{ErrorKeyword, JobStatusVerdict};
use lazy_static::lazy_static;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Node memory assumed for servers that do not declare one, in GB.
pub const DEFAULT_MAX_NODE_MEMORY_GB: f64 = 64.0;

const MOLPRO_SHIFT: &str = "shift,-1.0,-0.5;";

lazy_static! {
    /// Servers already warned about a missing memory value.
    static ref WARNED_SERVERS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Errors raised by the troubleshooters.
#[derive(Error, Debug)]
pub enum TrshError {
    /// No remedy chain is defined for the software
    #[error("Troubleshooting methods are not implemented for {0}")]
    UnsupportedSoftware(String),
    /// The verdict cannot be troubleshot, or lacks a value a remedy needs
    #[error("Malformed job status: {0}")]
    MalformedVerdict(String),
    /// A negative frequency troubleshoot found no negative frequency
    #[error("Could not determine a negative frequency for species {0} while troubleshooting for it.")]
    NoNegativeFrequency(String),
    /// A rotor scan could not be troubleshot
    #[error("Scan troubleshooting failed: {0}")]
    Scan(String),
    /// An output file could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] crate::parser::ParseError),
    /// Displacement does not match the geometry
    #[error("Geometry error: {0}")]
    Geometry(#[from] crate::geometry::GeometryError),
    /// File system error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for troubleshooting operations
pub type Result<T> = std::result::Result<T, TrshError>;

/// Ordered, duplicate-free list of remedy tags already tried for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TrshHistory(Vec<String>);

impl TrshHistory {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `tag` was already tried.
    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    /// Appends `tag` unless present. Returns `true` if it was added.
    pub fn record(&mut self, tag: &str) -> bool {
        if self.contains(tag) {
            return false;
        }
        self.0.push(tag.to_string());
        true
    }

    /// Number of recorded tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was tried yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tags in the order they were tried.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for TrshHistory {
    fn from(tags: Vec<String>) -> Self {
        let mut history = TrshHistory::new();
        for tag in tags {
            history.record(&tag);
        }
        history
    }
}

impl From<TrshHistory> for Vec<String> {
    fn from(history: TrshHistory) -> Self {
        history.0
    }
}

impl fmt::Display for TrshHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Resources the errored job ran with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobResources {
    /// Total job memory in GB
    pub memory_gb: f64,
    /// Number of cpu cores
    pub cpu_cores: u32,
    /// Whether the job already used a fine integration grid
    #[serde(default)]
    pub fine: bool,
}

/// Everything known about an errored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrshRequest {
    /// Species label
    pub label: String,
    /// Classification of the failed job
    pub verdict: JobStatusVerdict,
    /// Software the job ran with
    pub software: String,
    /// Job type
    pub job_type: JobType,
    /// Level of theory the job ran at
    pub level_of_theory: LevelOfTheory,
    /// Remedies already tried for this job
    #[serde(default)]
    pub history: TrshHistory,
    /// Server the job ran on
    pub server: ServerConfig,
    /// Memory, cores and grid of the job
    pub resources: JobResources,
    /// Number of non-hydrogen atoms
    #[serde(default)]
    pub num_heavy_atoms: usize,
    /// Whether the species is a lone hydrogen atom (H, D or T)
    #[serde(default)]
    pub is_h: bool,
    /// Software installed on the servers; `None` means all
    #[serde(default)]
    pub available_ess: Option<Vec<String>>,
}

/// Changes to make before resubmitting the job.
///
/// Fields not touched by the applied remedy keep the values of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemedyDecision {
    /// The request's history plus the tag applied now
    pub updated_history: TrshHistory,
    /// Tag of the applied remedy, `None` when exhausted
    pub applied: Option<String>,
    /// New level of theory, if changed
    pub level_of_theory_patch: Option<LevelOfTheory>,
    /// New software, if changed
    pub software_override: Option<Software>,
    /// New job type, if changed
    pub job_type_override: Option<JobType>,
    /// Keyword to add to the ESS input
    pub extra_input_keyword: String,
    /// Total job memory in GB
    pub memory_gb: f64,
    /// Number of cpu cores
    pub cpu_cores: u32,
    /// Whether to delete the checkpoint file before resubmitting
    pub remove_checkpoint: bool,
    /// Molpro level shift directive
    pub shift_keyword: String,
    /// Whether to use a fine integration grid
    pub fine: bool,
    /// No remedy is left; the job must be invalidated
    pub exhausted: bool,
    /// What was done and why
    pub explanation: String,
    /// Errors to report to the user
    pub errors: Vec<String>,
}

impl RemedyDecision {
    fn unchanged(request: &TrshRequest) -> Self {
        Self {
            updated_history: request.history.clone(),
            applied: None,
            level_of_theory_patch: None,
            software_override: None,
            job_type_override: None,
            extra_input_keyword: String::new(),
            memory_gb: request.resources.memory_gb,
            cpu_cores: request.resources.cpu_cores,
            remove_checkpoint: false,
            shift_keyword: String::new(),
            fine: request.resources.fine,
            exhausted: false,
            explanation: String::new(),
            errors: Vec::new(),
        }
    }
}

/// What the engine sees while evaluating rules.
pub struct TrshContext<'a> {
    /// The errored job
    pub request: &'a TrshRequest,
    /// Resolved software of the job
    pub software: Software,
    /// Maximum memory of one node of the job's server, in GB
    pub max_node_memory_gb: f64,
}

impl TrshContext<'_> {
    /// Whether the verdict carries `keyword`.
    pub fn has(&self, keyword: ErrorKeyword) -> bool {
        self.request.verdict.has_keyword(keyword)
    }

    /// Whether `tag` was already tried.
    pub fn tried(&self, tag: &str) -> bool {
        self.request.history.contains(tag)
    }

    /// Whether the job ran a CBS-QB3 composite method.
    pub fn is_cbs_qb3(&self) -> bool {
        self.request.level_of_theory.method == "cbs-qb3"
    }

    /// Whether `software` can be switched to.
    pub fn available(&self, software: Software) -> bool {
        match &self.request.available_ess {
            None => true,
            Some(list) => list.iter().any(|ess| ess.eq_ignore_ascii_case(software.as_str())),
        }
    }
}

/// Outcome of applying one remedy.
pub enum Step {
    /// The remedy was applied; carries the explanation
    Applied(String),
    /// The remedy shows the job cannot be fixed; carries the reason
    GiveUp(String),
}

/// Remedy computed from the failure details.
pub type Compute = fn(&TrshContext<'_>, &mut RemedyDecision) -> Result<Step>;

/// The change a rule makes to the job.
pub enum Remedy {
    /// Delete the checkpoint file
    RemoveCheckpoint,
    /// Add an input keyword
    Keyword(&'static str),
    /// Use a fine integration grid
    FineGrid,
    /// Change the level of theory, optionally with a keyword and job type
    Level {
        /// Method
        method: &'static str,
        /// Basis set, `None` for composite methods
        basis: Option<&'static str>,
        /// Keyword to add
        keyword: Option<&'static str>,
        /// New job type
        job_type: Option<JobType>,
    },
    /// Apply a Molpro level shift, optionally with a keyword
    Shift(Option<&'static str>),
    /// Rerun with another software
    Switch(Software),
    /// Computed from the error details
    Compute(Compute),
}

impl Remedy {
    fn apply(&self, ctx: &TrshContext<'_>, decision: &mut RemedyDecision, tag: &str) -> Result<Step> {
        match self {
            Remedy::RemoveCheckpoint => {
                decision.remove_checkpoint = true;
            }
            Remedy::Keyword(keyword) => {
                decision.extra_input_keyword = keyword.to_string();
            }
            Remedy::FineGrid => {
                decision.fine = true;
            }
            Remedy::Level {
                method,
                basis,
                keyword,
                job_type,
            } => {
                decision.level_of_theory_patch = Some(match basis {
                    Some(basis) => LevelOfTheory::new(method, basis),
                    None => LevelOfTheory::composite(method),
                });
                if let Some(keyword) = keyword {
                    decision.extra_input_keyword = keyword.to_string();
                }
                decision.job_type_override = *job_type;
            }
            Remedy::Shift(keyword) => {
                decision.shift_keyword = MOLPRO_SHIFT.to_string();
                if let Some(keyword) = keyword {
                    decision.extra_input_keyword = keyword.to_string();
                }
            }
            Remedy::Switch(software) => {
                decision.software_override = Some(*software);
                return Ok(Step::Applied(format!(
                    "Troubleshooting {} job using {} instead of {} for {}",
                    ctx.request.job_type,
                    software,
                    ctx.software,
                    ctx.request.label
                )));
            }
            Remedy::Compute(compute) => return compute(ctx, decision),
        }
        Ok(Step::Applied(format!(
            "Troubleshooting {} job in {} for {} using {}",
            ctx.request.job_type, ctx.software, ctx.request.label, tag
        )))
    }
}

/// One entry of a remedy chain.
pub struct Rule {
    /// History tag recorded when the rule is applied
    pub tag: &'static str,
    /// Whether the rule addresses the failure
    pub applies: fn(&TrshContext<'_>) -> bool,
    /// What the rule changes
    pub remedy: Remedy,
}

/// Ordered remedies for one software.
pub trait RemedyChain: Sync {
    /// The software whose jobs this chain repairs.
    fn software(&self) -> Software;

    /// Rules in the order they are tried.
    fn rules(&self) -> &'static [Rule];

    /// Extra explanation when the chain is exhausted.
    fn exhaustion_note(&self, _ctx: &TrshContext<'_>) -> Option<String> {
        None
    }
}

/// Looks up the remedy chain for a software name.
///
/// # Errors
///
/// Returns [`TrshError::UnsupportedSoftware`] for names without a chain.
pub fn remedy_chain(software: &str) -> Result<&'static dyn RemedyChain> {
    let software: Software = software
        .parse()
        .map_err(|_| TrshError::UnsupportedSoftware(software.to_string()))?;
    Ok(match software {
        Software::Gaussian => &GaussianChain,
        Software::QChem => &QChemChain,
        Software::Orca => &OrcaChain,
        Software::Molpro => &MolproChain,
        Software::TeraChem => &TeraChemChain,
    })
}

/// Gaussian remedies.
pub struct GaussianChain;

static GAUSSIAN_RULES: &[Rule] = &[
    Rule {
        tag: "checkfie=None",
        applies: |c| c.has(ErrorKeyword::CheckFile),
        remedy: Remedy::RemoveCheckpoint,
    },
    Rule {
        tag: "cartesian",
        applies: |c| c.has(ErrorKeyword::InternalCoordinateError) && c.request.job_type == JobType::Opt,
        remedy: Remedy::Keyword("opt=(cartesian,nosymm)"),
    },
    Rule {
        tag: "fine",
        applies: |c| c.has(ErrorKeyword::Unconverged) && !c.request.resources.fine,
        remedy: Remedy::FineGrid,
    },
    Rule {
        tag: "scf=(qc,nosymm)",
        applies: |c| c.has(ErrorKeyword::SCF),
        remedy: Remedy::Keyword("scf=(qc,nosymm)"),
    },
    Rule {
        tag: "scf=(NDump=30)",
        applies: |c| c.has(ErrorKeyword::SCF),
        remedy: Remedy::Keyword("scf=(NDump=30)"),
    },
    Rule {
        tag: "scf=NoDIIS",
        applies: |c| c.has(ErrorKeyword::SCF),
        remedy: Remedy::Keyword("scf=NoDIIS"),
    },
    Rule {
        tag: "scf=nosymm",
        applies: |c| c.has(ErrorKeyword::SCF),
        remedy: Remedy::Keyword("scf=nosymm"),
    },
    Rule {
        tag: "int=(Acc2E=14)",
        applies: |_| true,
        remedy: Remedy::Keyword("int=(Acc2E=14)"),
    },
    Rule {
        tag: "cbs-qb3",
        applies: |c| !c.is_cbs_qb3() && !c.request.job_type.is_scan() && c.request.num_heavy_atoms <= 10,
        remedy: Remedy::Level {
            method: "cbs-qb3",
            basis: None,
            keyword: None,
            job_type: Some(JobType::Composite),
        },
    },
    Rule {
        tag: "memory",
        applies: |c| c.has(ErrorKeyword::Memory),
        remedy: Remedy::Compute(gaussian_memory),
    },
    Rule {
        tag: "scf=(qc,nosymm) & CBS-QB3",
        applies: |c| !c.is_cbs_qb3(),
        remedy: Remedy::Level {
            method: "cbs-qb3",
            basis: None,
            keyword: Some("scf=(qc,nosymm)"),
            job_type: None,
        },
    },
    Rule {
        tag: "qchem",
        applies: |c| c.request.job_type != JobType::Composite && c.available(Software::QChem),
        remedy: Remedy::Switch(Software::QChem),
    },
    Rule {
        tag: "molpro",
        applies: |c| {
            !matches!(c.request.job_type, JobType::Composite | JobType::Scan)
                && c.available(Software::Molpro)
        },
        remedy: Remedy::Switch(Software::Molpro),
    },
];

impl RemedyChain for GaussianChain {
    fn software(&self) -> Software {
        Software::Gaussian
    }

    fn rules(&self) -> &'static [Rule] {
        GAUSSIAN_RULES
    }
}

fn gaussian_memory(ctx: &TrshContext<'_>, decision: &mut RemedyDecision) -> Result<Step> {
    let previous = ctx.request.resources.memory_gb;
    decision.memory_gb = (previous * 2.0).min(ctx.max_node_memory_gb * 0.9);
    Ok(Step::Applied(format!(
        "Troubleshooting {} job in {} for {} using more memory: {} GB instead of {} GB",
        ctx.request.job_type, ctx.software, ctx.request.label, decision.memory_gb, previous
    )))
}

/// QChem remedies.
pub struct QChemChain;

static QCHEM_RULES: &[Rule] = &[
    Rule {
        tag: "max_cycles",
        applies: |c| c.has(ErrorKeyword::MaxOptCycles),
        remedy: Remedy::Keyword("\n   GEOM_OPT_MAX_CYCLES 250"),
    },
    Rule {
        tag: "DIIS_GDM",
        applies: |c| c.has(ErrorKeyword::SCF),
        remedy: Remedy::Keyword("\n   SCF_ALGORITHM DIIS_GDM\n   MAX_SCF_CYCLES 1000"),
    },
    Rule {
        tag: "SYM_IGNORE",
        applies: |_| true,
        remedy: Remedy::Keyword(
            "\n   SCF_ALGORITHM DIIS_GDM\n   MAX_SCF_CYCLES 250\n   SYM_IGNORE     True",
        ),
    },
    Rule {
        tag: "wB97X-D3/def2-TZVP",
        applies: |_| true,
        remedy: Remedy::Level {
            method: "wb97x-d3",
            basis: Some("def2-tzvp"),
            keyword: None,
            job_type: None,
        },
    },
    Rule {
        tag: "b3lyp/6-311++g(d,p)",
        applies: |_| true,
        remedy: Remedy::Level {
            method: "b3lyp",
            basis: Some("6-311++g(d,p)"),
            keyword: None,
            job_type: None,
        },
    },
    Rule {
        tag: "gaussian",
        applies: |c| c.available(Software::Gaussian),
        remedy: Remedy::Switch(Software::Gaussian),
    },
    Rule {
        tag: "molpro",
        applies: |c| c.request.job_type != JobType::Scan && c.available(Software::Molpro),
        remedy: Remedy::Switch(Software::Molpro),
    },
];

impl RemedyChain for QChemChain {
    fn software(&self) -> Software {
        Software::QChem
    }

    fn rules(&self) -> &'static [Rule] {
        QCHEM_RULES
    }
}

/// Orca remedies.
pub struct OrcaChain;

static ORCA_RULES: &[Rule] = &[
    Rule {
        tag: "memory",
        applies: |c| c.has(ErrorKeyword::Memory) && !c.has(ErrorKeyword::MaxTotalJobMemory),
        remedy: Remedy::Compute(orca_memory),
    },
    Rule {
        tag: "cpu",
        applies: |c| {
            c.has(ErrorKeyword::Memory)
                && (c.has(ErrorKeyword::MaxTotalJobMemory) || c.tried("memory"))
        },
        remedy: Remedy::Compute(orca_fewer_cores_for_memory),
    },
    Rule {
        tag: "cpu",
        applies: |c| c.has(ErrorKeyword::Cpu),
        remedy: Remedy::Compute(orca_cap_cores),
    },
];

impl RemedyChain for OrcaChain {
    fn software(&self) -> Software {
        Software::Orca
    }

    fn rules(&self) -> &'static [Rule] {
        ORCA_RULES
    }

    fn exhaustion_note(&self, ctx: &TrshContext<'_>) -> Option<String> {
        if ctx.request.level_of_theory.method.contains("dlpno") && ctx.request.is_h {
            Some("DLPNO methods are not supported for the H atom (or its isotopes D and T) in Orca.".to_string())
        } else {
            None
        }
    }
}

/// Per-core memory Orca asked for, rounded up to the next 100 MB.
fn orca_required_mb_per_core(ctx: &TrshContext<'_>) -> Result<f64> {
    let error = &ctx.request.verdict.error;
    let tokens: Vec<&str> = error.split_whitespace().collect();
    let value = tokens
        .len()
        .checked_sub(2)
        .and_then(|i| tokens[i].parse::<f64>().ok())
        .filter(|mb| mb.is_finite() && *mb > 0.0)
        .ok_or_else(|| {
            TrshError::MalformedVerdict(format!("no per-core memory requirement in '{}'", error))
        })?;
    Ok((value / 100.0).ceil() * 100.0)
}

fn orca_memory(ctx: &TrshContext<'_>, decision: &mut RemedyDecision) -> Result<Step> {
    let per_core = orca_required_mb_per_core(ctx)?;
    let cores = decision.cpu_cores as f64;
    let total = (per_core * cores / 1024.0 + 5.0).ceil();
    decision.memory_gb = total.min(ctx.max_node_memory_gb);
    Ok(Step::Applied(format!(
        "Troubleshooting {} job in {} for {} using {} GB total memory ({} MB per cpu core) and {} cpu cores.",
        ctx.request.job_type, ctx.software, ctx.request.label, decision.memory_gb, per_core, decision.cpu_cores
    )))
}

fn orca_fewer_cores_for_memory(ctx: &TrshContext<'_>, decision: &mut RemedyDecision) -> Result<Step> {
    let required = orca_required_mb_per_core(ctx)?;
    if ctx.request.resources.cpu_cores == 0 {
        return Err(TrshError::MalformedVerdict(format!(
            "the Orca job of {} reports zero cpu cores",
            ctx.request.label
        )));
    }
    let cores = ctx.request.resources.cpu_cores as f64;
    let available = (ctx.request.resources.memory_gb / cores * 1024.0).ceil();
    info!(
        "The Orca job of {} ran with {} cpu cores and {} MB per core but requires {} MB per core; reducing cpu cores",
        ctx.request.label, cores, available, required
    );
    let fitting = (cores * available / required).floor();
    let new_cores = if fitting.is_finite() {
        fitting.min(u32::MAX as f64) as i64 - 2
    } else {
        0
    };
    if new_cores < 1 {
        return Ok(Step::GiveUp(format!(
            "Not enough computational resource to accomplish job {}. Please consider cheaper methods or allocate more resources if possible.",
            ctx.request.label
        )));
    }
    if new_cores == 1 {
        warn!(
            "Troubleshooting job {} using a single cpu core; the job may take unrealistically long",
            ctx.request.label
        );
    }
    decision.cpu_cores = new_cores as u32;
    decision.memory_gb = (required * new_cores as f64 / 1024.0 + 5.0)
        .ceil()
        .min(ctx.max_node_memory_gb);
    Ok(Step::Applied(format!(
        "Troubleshooting {} job in {} for {} using {} GB total memory and {} cpu cores.",
        ctx.request.job_type, ctx.software, ctx.request.label, decision.memory_gb, decision.cpu_cores
    )))
}

fn orca_cap_cores(ctx: &TrshContext<'_>, decision: &mut RemedyDecision) -> Result<Step> {
    let error = &ctx.request.verdict.error;
    let cores = error
        .split_whitespace()
        .last()
        .map(|t| t.trim_end_matches('.'))
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| TrshError::MalformedVerdict(format!("no cpu core limit in '{}'", error)))?;
    decision.cpu_cores = cores;
    Ok(Step::Applied(format!(
        "Troubleshooting {} job in {} for {} using {} cpu cores (reduced).",
        ctx.request.job_type, ctx.software, ctx.request.label, cores
    )))
}

/// Molpro remedies.
pub struct MolproChain;

static MOLPRO_RULES: &[Rule] = &[
    Rule {
        tag: "memory",
        applies: |c| c.has(ErrorKeyword::Memory),
        remedy: Remedy::Compute(molpro_memory),
    },
    Rule {
        tag: "shift",
        applies: |_| true,
        remedy: Remedy::Shift(None),
    },
    Rule {
        tag: "vdz",
        applies: |_| true,
        remedy: Remedy::Keyword("vdz"),
    },
    Rule {
        tag: "vdz & shift",
        applies: |_| true,
        remedy: Remedy::Shift(Some("vdz")),
    },
    Rule {
        tag: "memory",
        applies: |_| true,
        remedy: Remedy::Compute(molpro_node_memory),
    },
    Rule {
        tag: "gaussian",
        applies: |c| c.available(Software::Gaussian),
        remedy: Remedy::Switch(Software::Gaussian),
    },
    Rule {
        tag: "qchem",
        applies: |c| c.available(Software::QChem),
        remedy: Remedy::Switch(Software::QChem),
    },
];

impl RemedyChain for MolproChain {
    fn software(&self) -> Software {
        Software::Molpro
    }

    fn rules(&self) -> &'static [Rule] {
        MOLPRO_RULES
    }
}

fn molpro_memory(ctx: &TrshContext<'_>, decision: &mut RemedyDecision) -> Result<Step> {
    let error = &ctx.request.verdict.error;
    let tokens: Vec<&str> = error.split_whitespace().collect();
    let mw = tokens
        .len()
        .checked_sub(2)
        .and_then(|i| tokens[i].parse::<f64>().ok())
        .ok_or_else(|| TrshError::MalformedVerdict(format!("no memory requirement in '{}'", error)))?;
    let add_mw = (mw / 100.0).ceil() * 100.0;
    let previous = ctx.request.resources.memory_gb;
    decision.memory_gb = (previous + add_mw / 128.0 + 5.0).min(ctx.max_node_memory_gb);
    Ok(Step::Applied(format!(
        "Troubleshooting {} job in {} for {} using memory: {:.2} GB instead of {} GB",
        ctx.request.job_type, ctx.software, ctx.request.label, decision.memory_gb, previous
    )))
}

fn molpro_node_memory(ctx: &TrshContext<'_>, decision: &mut RemedyDecision) -> Result<Step> {
    decision.memory_gb = ctx.max_node_memory_gb;
    decision.shift_keyword = MOLPRO_SHIFT.to_string();
    Ok(Step::Applied(format!(
        "Troubleshooting {} job in {} for {} using memory: {:.2} GB instead of {} GB, with a level shift",
        ctx.request.job_type,
        ctx.software,
        ctx.request.label,
        decision.memory_gb,
        ctx.request.resources.memory_gb
    )))
}

/// TeraChem has no remedies; every failure is final.
pub struct TeraChemChain;

impl RemedyChain for TeraChemChain {
    fn software(&self) -> Software {
        Software::TeraChem
    }

    fn rules(&self) -> &'static [Rule] {
        &[]
    }
}

/// Maximum node memory of `server`, falling back to [`DEFAULT_MAX_NODE_MEMORY_GB`].
///
/// The fallback is logged once per server name.
pub fn max_node_memory(server: &ServerConfig) -> f64 {
    match server.memory {
        Some(memory) => memory,
        None => {
            if let Ok(mut warned) = WARNED_SERVERS.lock() {
                if warned.insert(server.name.clone()) {
                    warn!(
                        "No maximum node memory defined for server {}; assuming {} GB. Remedies that raise job memory depend on this value.",
                        server.name, DEFAULT_MAX_NODE_MEMORY_GB
                    );
                }
            }
            DEFAULT_MAX_NODE_MEMORY_GB
        }
    }
}

/// Failures no remedy can fix.
fn precheck(ctx: &TrshContext<'_>) -> Option<String> {
    let request = ctx.request;
    if ctx.has(ErrorKeyword::DiskSpace) {
        return Some(format!(
            "Error: Could not troubleshoot {} for {}! The job ran out of disc space on {}; ",
            request.job_type, request.label, request.server.name
        ));
    }
    let error = &request.verdict.error;
    if ctx.has(ErrorKeyword::BasisSet)
        && (error.contains("Unrecognized basis set") || error.contains("is not appropriate for"))
    {
        return Some(format!(
            "Error: Could not recognize basis set in {}: {}; ",
            ctx.software.display_name(),
            error
        ));
    }
    None
}

fn exhaust(mut decision: RemedyDecision, request: &TrshRequest, reasons: Vec<String>) -> RemedyDecision {
    decision.exhausted = true;
    decision.applied = None;
    decision.errors.extend(reasons);
    let summary = format!(
        "Error: Could not troubleshoot {} for {}! Tried troubleshooting with the following methods: {}; ",
        request.job_type, request.label, decision.updated_history
    );
    error!("{}", summary.trim_end_matches("; "));
    decision.explanation = decision
        .errors
        .first()
        .cloned()
        .unwrap_or_else(|| summary.clone());
    decision.errors.push(summary);
    decision
}

/// Selects the next remedy for an errored job.
///
/// The request is not modified; the returned decision carries the updated
/// history. When no remedy is left the decision is `exhausted` and its `errors`
/// list every remedy tried.
///
/// # Errors
///
/// - [`TrshError::UnsupportedSoftware`] if the request names a software without a chain
/// - [`TrshError::MalformedVerdict`] if the verdict is `Done`, or lacks a value a
///   remedy must parse
///
/// # Examples
///
/// ```
/// use esstrsh::ess::{JobType, LevelOfTheory};
/// use esstrsh::settings::ServerConfig;
/// use esstrsh::status::{ErrorKeyword, JobStatusVerdict};
/// use esstrsh::trsh::{next_remedy, JobResources, TrshHistory, TrshRequest};
///
/// let request = TrshRequest {
///     label: "CH3OH".to_string(),
///     verdict: JobStatusVerdict::errored(vec![ErrorKeyword::SCF, ErrorKeyword::GL502], "Unconverged SCF.", ""),
///     software: "gaussian".to_string(),
///     job_type: JobType::Opt,
///     level_of_theory: LevelOfTheory::new("wb97xd", "def2-tzvp"),
///     history: TrshHistory::new(),
///     server: ServerConfig::local(),
///     resources: JobResources { memory_gb: 16.0, cpu_cores: 8, fine: false },
///     num_heavy_atoms: 2,
///     is_h: false,
///     available_ess: None,
/// };
/// let decision = next_remedy(&request).unwrap();
/// assert_eq!(decision.extra_input_keyword, "scf=(qc,nosymm)");
/// assert!(decision.updated_history.contains("scf=(qc,nosymm)"));
/// ```
pub fn next_remedy(request: &TrshRequest) -> Result<RemedyDecision> {
    let chain = remedy_chain(&request.software)?;
    if request.verdict.is_done() {
        return Err(TrshError::MalformedVerdict(format!(
            "the {} job of {} terminated normally, there is nothing to troubleshoot",
            request.job_type, request.label
        )));
    }
    let ctx = TrshContext {
        request,
        software: chain.software(),
        max_node_memory_gb: max_node_memory(&request.server),
    };
    let mut decision = RemedyDecision::unchanged(request);

    if let Some(reason) = precheck(&ctx) {
        return Ok(exhaust(decision, request, vec![reason]));
    }

    for rule in chain.rules() {
        if ctx.tried(rule.tag) || !(rule.applies)(&ctx) {
            continue;
        }
        match rule.remedy.apply(&ctx, &mut decision, rule.tag)? {
            Step::Applied(explanation) => {
                info!("{}", explanation);
                decision.updated_history.record(rule.tag);
                decision.applied = Some(rule.tag.to_string());
                decision.explanation = explanation;
                return Ok(decision);
            }
            Step::GiveUp(reason) => {
                info!("{}", reason);
                decision.updated_history.record(rule.tag);
                return Ok(exhaust(RemedyDecision {
                    updated_history: decision.updated_history,
                    ..RemedyDecision::unchanged(request)
                }, request, vec![reason]));
            }
        }
    }

    let reasons = chain.exhaustion_note(&ctx).into_iter().collect();
    Ok(exhaust(decision, request, reasons))
}

/// Levels of theory known to keep conformer connectivity, per software.
fn conformer_levels(software: Software) -> Option<&'static [&'static str]> {
    match software {
        Software::Gaussian => Some(&["wb97xd/def2TZVP", "apfd/def2TZVP"]),
        Software::QChem => Some(&["wb97x-d3/def2-TZVP"]),
        Software::Orca => Some(&["wB97X-D3/def2-TZVP"]),
        Software::TeraChem => Some(&["wb97xd3/def2-TZVP"]),
        Software::Molpro => None,
    }
}

/// Suggests a level of theory for re-optimizing conformers that failed the
/// isomorphism check.
///
/// Returns the first untried level for the software and records it in
/// `history` as `"conformer <level>"`, or `None` once every level was tried.
///
/// # Errors
///
/// Returns [`TrshError::UnsupportedSoftware`] for software without a list of
/// levels (Molpro) and for unknown names.
pub fn trsh_conformer_isomorphism(software: &str, history: &mut TrshHistory) -> Result<Option<String>> {
    let unsupported = || TrshError::UnsupportedSoftware(format!("conformer troubleshooting with {}", software));
    let parsed: Software = software.parse().map_err(|_| unsupported())?;
    let levels = conformer_levels(parsed).ok_or_else(unsupported)?;
    for level in levels {
        let tag = format!("conformer {}", level);
        if history.record(&tag) {
            info!("Troubleshooting conformers in {} using {}", parsed, level);
            return Ok(Some(level.to_string()));
        }
    }
    Ok(None)
}

/// Troubleshoots a rotor scan.
///
/// `freeze` produces Gaussian `D i j k l F` lines (1-based atom numbers) freezing
/// every torsion of the species other than `scan`; `inc_res` halves the
/// resolution, capped at 4 degrees and snapped to a divisor of 360 among
/// `{4, 2, 1}`. Returns the input keywords and the new resolution.
///
/// # Errors
///
/// Returns [`TrshError::Scan`] if `methods` is empty, or if `freeze` is requested
/// and `scan` is not one of `species_scans`.
pub fn trsh_scan_job(
    label: &str,
    scan_res: f64,
    scan: [usize; 4],
    species_scans: &[[usize; 4]],
    methods: &[ScanAction],
) -> Result<(String, f64)> {
    if methods.is_empty() {
        return Err(TrshError::Scan(format!(
            "expected at least one scan troubleshooting method for {}",
            label
        )));
    }
    let mut keywords = String::new();
    if methods.contains(&ScanAction::Freeze) {
        if !species_scans.contains(&scan) {
            return Err(TrshError::Scan(format!(
                "could not find the dihedral to troubleshoot for in the scan list of species {}",
                label
            )));
        }
        let others: Vec<&[usize; 4]> = species_scans.iter().filter(|s| **s != scan).collect();
        if !others.is_empty() {
            keywords.push('\n');
            for torsion in others {
                let atoms: Vec<String> = torsion.iter().map(|a| (a + 1).to_string()).collect();
                keywords.push_str(&format!("D {} F\n", atoms.join(" ")));
            }
        }
    }
    let mut resolution = scan_res;
    if methods.contains(&ScanAction::IncRes) {
        let halved = (scan_res / 2.0).floor().min(4.0);
        resolution = [4.0, 2.0, 1.0]
            .iter()
            .copied()
            .fold(4.0_f64, |best, candidate| {
                if (candidate - halved).abs() < (best - halved).abs() {
                    candidate
                } else {
                    best
                }
            });
    }
    info!(
        "Troubleshooting the scan of {} around {:?} with {:?}, resolution {} deg",
        label, scan, methods, resolution
    );
    Ok((keywords, resolution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ClusterSoft;

    fn server(memory: Option<f64>) -> ServerConfig {
        ServerConfig {
            name: "server1".to_string(),
            cluster_soft: ClusterSoft::Slurm,
            memory,
            address: None,
            user: None,
        }
    }

    fn request(software: &str, keywords: Vec<ErrorKeyword>, error: &str) -> TrshRequest {
        TrshRequest {
            label: "spc1".to_string(),
            verdict: JobStatusVerdict::errored(keywords, error, ""),
            software: software.to_string(),
            job_type: JobType::Opt,
            level_of_theory: LevelOfTheory::new("wb97xd", "def2-tzvp"),
            history: TrshHistory::new(),
            server: server(Some(64.0)),
            resources: JobResources {
                memory_gb: 16.0,
                cpu_cores: 8,
                fine: false,
            },
            num_heavy_atoms: 2,
            is_h: false,
            available_ess: None,
        }
    }

    #[test]
    fn test_history_is_duplicate_free() {
        let history = TrshHistory::from(vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        assert_eq!(history.as_slice(), &["a".to_string(), "b".to_string()]);
        let json = serde_json::to_string(&history).unwrap();
        assert_eq!(json, "[\"a\",\"b\"]");
    }

    #[test]
    fn test_gaussian_checkfile_first() {
        let req = request("gaussian", vec![ErrorKeyword::CheckFile], "");
        let decision = next_remedy(&req).unwrap();
        assert!(decision.remove_checkpoint);
        assert_eq!(decision.applied.as_deref(), Some("checkfie=None"));
        assert!(req.history.is_empty());
    }

    #[test]
    fn test_gaussian_scf_sequence() {
        let mut req = request("gaussian", vec![ErrorKeyword::SCF, ErrorKeyword::GL502], "Unconverged SCF.");
        let expected = ["scf=(qc,nosymm)", "scf=(NDump=30)", "scf=NoDIIS", "scf=nosymm", "int=(Acc2E=14)"];
        for keyword in expected {
            let decision = next_remedy(&req).unwrap();
            assert_eq!(decision.extra_input_keyword, keyword);
            req.history = decision.updated_history;
        }
        let decision = next_remedy(&req).unwrap();
        assert_eq!(decision.level_of_theory_patch, Some(LevelOfTheory::composite("cbs-qb3")));
        assert_eq!(decision.job_type_override, Some(JobType::Composite));
    }

    #[test]
    fn test_gaussian_fine_grid() {
        let req = request("gaussian", vec![ErrorKeyword::Unconverged, ErrorKeyword::GL9999], "Unconverged");
        let decision = next_remedy(&req).unwrap();
        assert!(decision.fine);
        assert_eq!(decision.applied.as_deref(), Some("fine"));
    }

    #[test]
    fn test_gaussian_memory_doubles_within_node() {
        let mut req = request("gaussian", vec![ErrorKeyword::Memory], "Memory allocation failed");
        req.num_heavy_atoms = 11;
        req.history = TrshHistory::from(vec!["int=(Acc2E=14)".to_string()]);
        let decision = next_remedy(&req).unwrap();
        assert_eq!(decision.memory_gb, 32.0);
        assert_eq!(decision.applied.as_deref(), Some("memory"));

        req.history = decision.updated_history;
        let next = next_remedy(&req).unwrap();
        assert_ne!(next.applied.as_deref(), Some("memory"));
        assert_eq!(next.updated_history.as_slice().iter().filter(|t| *t == "memory").count(), 1);
    }

    #[test]
    fn test_gaussian_memory_capped_by_node() {
        let mut req = request("gaussian", vec![ErrorKeyword::Memory], "");
        req.num_heavy_atoms = 11;
        req.resources.memory_gb = 40.0;
        req.history = TrshHistory::from(vec!["int=(Acc2E=14)".to_string()]);
        let decision = next_remedy(&req).unwrap();
        assert!((decision.memory_gb - 57.6).abs() < 1e-9);
    }

    #[test]
    fn test_gaussian_respects_available_ess() {
        let mut req = request("gaussian", vec![ErrorKeyword::Unknown], "");
        req.level_of_theory = LevelOfTheory::composite("cbs-qb3");
        req.available_ess = Some(vec!["Gaussian".to_string(), "Molpro".to_string()]);
        req.history = TrshHistory::from(vec!["int=(Acc2E=14)".to_string()]);
        let decision = next_remedy(&req).unwrap();
        assert_eq!(decision.software_override, Some(Software::Molpro));
    }

    #[test]
    fn test_disk_space_is_exhausted_immediately() {
        let req = request("gaussian", vec![ErrorKeyword::DiskSpace], "Ran out of disk space.");
        let decision = next_remedy(&req).unwrap();
        assert!(decision.exhausted);
        assert!(decision.errors[0].contains("disc space"));
        assert!(decision.updated_history.is_empty());
    }

    #[test]
    fn test_unrecognized_basis_is_exhausted() {
        let req = request("molpro", vec![ErrorKeyword::BasisSet], "Unrecognized basis set 6-311G**");
        let decision = next_remedy(&req).unwrap();
        assert!(decision.exhausted);
    }

    #[test]
    fn test_qchem_max_cycles() {
        let req = request("qchem", vec![ErrorKeyword::MaxOptCycles], "");
        let decision = next_remedy(&req).unwrap();
        assert_eq!(decision.extra_input_keyword, "\n   GEOM_OPT_MAX_CYCLES 250");
    }

    #[test]
    fn test_orca_memory_per_core() {
        let req = request(
            "orca",
            vec![ErrorKeyword::SCF, ErrorKeyword::Memory],
            "Orca suggests to increase per cpu core memory to 289 MB.",
        );
        let decision = next_remedy(&req).unwrap();
        // 300 MB * 8 cores / 1024 + 5 = 7.34 -> 8 GB
        assert_eq!(decision.memory_gb, 8.0);
        assert_eq!(decision.cpu_cores, 8);
    }

    #[test]
    fn test_orca_reduces_cores_at_node_maximum() {
        let mut req = request(
            "orca",
            vec![ErrorKeyword::MDCI, ErrorKeyword::Memory, ErrorKeyword::MaxTotalJobMemory],
            "Orca suggests to increase per cpu core memory to 9718 MB.",
        );
        req.resources = JobResources {
            memory_gb: 64.0,
            cpu_cores: 16,
            fine: false,
        };
        let decision = next_remedy(&req).unwrap();
        // per core available 4096 MB, required 9800 MB: floor(16 * 4096 / 9800) - 2 = 4
        assert_eq!(decision.cpu_cores, 4);
        assert_eq!(decision.applied.as_deref(), Some("cpu"));
    }

    #[test]
    fn test_orca_too_few_cores_exhausts() {
        let mut req = request(
            "orca",
            vec![ErrorKeyword::Memory, ErrorKeyword::MaxTotalJobMemory],
            "Orca suggests to increase per cpu core memory to 50000 MB.",
        );
        req.resources.cpu_cores = 4;
        let decision = next_remedy(&req).unwrap();
        assert!(decision.exhausted);
        assert!(decision.errors[0].contains("Not enough computational resource"));
    }

    #[test]
    fn test_orca_zero_memory_request_is_malformed() {
        let req = request(
            "orca",
            vec![ErrorKeyword::Memory, ErrorKeyword::MaxTotalJobMemory],
            "Orca suggests to increase per cpu core memory to 0 MB.",
        );
        assert!(matches!(next_remedy(&req), Err(TrshError::MalformedVerdict(_))));

        let mut req = request(
            "orca",
            vec![ErrorKeyword::Memory, ErrorKeyword::MaxTotalJobMemory],
            "Orca suggests to increase per cpu core memory to 9718 MB.",
        );
        req.resources.cpu_cores = 0;
        assert!(matches!(next_remedy(&req), Err(TrshError::MalformedVerdict(_))));
    }

    #[test]
    fn test_orca_cpu_cap() {
        let req = request(
            "orca",
            vec![ErrorKeyword::MDCI, ErrorKeyword::Cpu],
            "The maximum number of cpu cores can be used for this job is 10.",
        );
        let decision = next_remedy(&req).unwrap();
        assert_eq!(decision.cpu_cores, 10);
    }

    #[test]
    fn test_orca_dlpno_hydrogen_exhausts() {
        let mut req = request("orca", vec![ErrorKeyword::Unknown], "");
        req.level_of_theory = LevelOfTheory::new("dlpno-ccsd(t)", "def2-tzvp");
        req.is_h = true;
        let decision = next_remedy(&req).unwrap();
        assert!(decision.exhausted);
        assert!(decision.errors[0].contains("DLPNO"));
    }

    #[test]
    fn test_molpro_memory() {
        let req = request("molpro", vec![ErrorKeyword::Memory], "Additional memory required: 246.03 MW");
        let decision = next_remedy(&req).unwrap();
        // 300 MW / 128 + 5 + 16
        assert!((decision.memory_gb - (16.0 + 300.0 / 128.0 + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_molpro_shift_then_vdz() {
        let mut req = request("molpro", vec![ErrorKeyword::Unconverged], "Unconverged");
        let first = next_remedy(&req).unwrap();
        assert_eq!(first.shift_keyword, "shift,-1.0,-0.5;");
        req.history = first.updated_history;
        let second = next_remedy(&req).unwrap();
        assert_eq!(second.extra_input_keyword, "vdz");
        assert!(second.shift_keyword.is_empty());
    }

    #[test]
    fn test_terachem_always_exhausted() {
        let req = request("terachem", vec![ErrorKeyword::Unknown], "");
        let decision = next_remedy(&req).unwrap();
        assert!(decision.exhausted);
        assert!(decision.errors.last().unwrap().contains("Tried troubleshooting"));
    }

    #[test]
    fn test_unsupported_software() {
        let req = request("psi4", vec![ErrorKeyword::Unknown], "");
        assert!(matches!(next_remedy(&req), Err(TrshError::UnsupportedSoftware(_))));
    }

    #[test]
    fn test_done_verdict_is_malformed() {
        let mut req = request("gaussian", vec![], "");
        req.verdict = JobStatusVerdict::done();
        assert!(matches!(next_remedy(&req), Err(TrshError::MalformedVerdict(_))));
    }

    #[test]
    fn test_missing_server_memory_defaults() {
        assert_eq!(max_node_memory(&server(None)), DEFAULT_MAX_NODE_MEMORY_GB);
        assert_eq!(max_node_memory(&server(Some(128.0))), 128.0);
    }

    #[test]
    fn test_conformer_isomorphism() {
        let mut history = TrshHistory::new();
        assert_eq!(
            trsh_conformer_isomorphism("gaussian", &mut history).unwrap().as_deref(),
            Some("wb97xd/def2TZVP")
        );
        assert_eq!(
            trsh_conformer_isomorphism("gaussian", &mut history).unwrap().as_deref(),
            Some("apfd/def2TZVP")
        );
        assert_eq!(trsh_conformer_isomorphism("gaussian", &mut history).unwrap(), None);
        assert!(history.contains("conformer apfd/def2TZVP"));
        assert!(matches!(
            trsh_conformer_isomorphism("molpro", &mut history),
            Err(TrshError::UnsupportedSoftware(_))
        ));
    }

    #[test]
    fn test_trsh_scan_freeze_and_resolution() {
        let scans = [[0, 1, 2, 3], [1, 2, 3, 4], [4, 5, 6, 7]];
        let (keywords, res) = trsh_scan_job(
            "spc",
            8.0,
            [1, 2, 3, 4],
            &scans,
            &[ScanAction::IncRes, ScanAction::Freeze],
        )
        .unwrap();
        assert_eq!(keywords, "\nD 1 2 3 4 F\nD 5 6 7 8 F\n");
        assert_eq!(res, 4.0);
    }

    #[test]
    fn test_trsh_scan_resolution_snaps() {
        let (_, res) = trsh_scan_job("spc", 6.0, [0, 1, 2, 3], &[], &[ScanAction::IncRes]).unwrap();
        assert_eq!(res, 4.0);
        let (_, res) = trsh_scan_job("spc", 4.0, [0, 1, 2, 3], &[], &[ScanAction::IncRes]).unwrap();
        assert_eq!(res, 2.0);
        let (_, res) = trsh_scan_job("spc", 1.0, [0, 1, 2, 3], &[], &[ScanAction::IncRes]).unwrap();
        assert_eq!(res, 1.0);
    }

    #[test]
    fn test_trsh_scan_errors() {
        assert!(trsh_scan_job("spc", 8.0, [0, 1, 2, 3], &[], &[]).is_err());
        assert!(trsh_scan_job("spc", 8.0, [0, 1, 2, 3], &[[1, 2, 3, 4]], &[ScanAction::Freeze]).is_err());
    }
}
