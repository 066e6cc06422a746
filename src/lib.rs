#![warn(missing_docs)]

//! esstrsh - Troubleshooting of electronic structure software (ESS) jobs
//!
//! esstrsh reads the output log of a quantum chemistry job, decides whether it
//! finished or why it failed, and picks the next remedy to try before the job
//! is resubmitted. It covers Gaussian, QChem, Orca, Molpro and TeraChem.
//!
//! # Overview
//!
//! A typical troubleshooting cycle:
//!
//! 1. **Classify** the log with [`status::determine_ess_status`], giving a
//!    [`status::JobStatusVerdict`] with error keywords.
//! 2. **Select a remedy** with [`trsh::next_remedy`], which walks the ESS's
//!    ordered remedy chain and skips everything already in the job's
//!    [`trsh::TrshHistory`].
//! 3. **Resubmit** with the changed keywords, level of theory, memory or
//!    cores. When every remedy was tried, the decision is `exhausted`.
//!
//! Besides errored logs, the crate handles:
//!
//! - **Rotor scans**: [`scan::scan_quality_check`] validates an energy profile
//!   and recommends `inc_res`, `freeze` or `change_conformer` actions.
//! - **Negative frequencies**: [`freq::trsh_negative_freq`] perturbs a
//!   geometry along its imaginary normal modes.
//! - **Server failures**: [`server::trsh_job_on_server`] deletes a job and
//!   moves it to an untried node.
//!
//! # Quick Start
//!
//! ```no_run
//! use esstrsh::ess::JobType;
//! use esstrsh::status::determine_ess_status;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let verdict = determine_ess_status(Path::new("opt_a1/output.log"), "ethanol", JobType::Opt, None)?;
//!     if !verdict.is_done() {
//!         println!("{:?}: {}", verdict.keywords, verdict.error);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`ess`](ess/index.html) - ESS names, job types and levels of theory
//! - [`status`](status/index.html) - Log classification
//! - [`trsh`](trsh/index.html) - Remedy chains
//! - [`scan`](scan/index.html) - Rotor scan quality checks
//! - [`freq`](freq/index.html) - Negative frequency troubleshooting
//! - [`server`](server/index.html) - Scheduler-level recovery
//! - [`parser`](parser/index.html) - Output parsing collaborators
//! - [`geometry`](geometry/index.html) - Cartesian geometries
//! - [`settings`](settings/index.html) - Configuration files
//! - [`help`](help/index.html) - Built-in help system

/// ESS, job type and level of theory vocabulary
pub mod ess;
/// Negative frequency troubleshooting
pub mod freq;
pub mod geometry;
/// Built-in help system
pub mod help;
pub mod parser;
pub mod scan;
pub mod server;
/// Configuration management system
pub mod settings;
pub mod status;
pub mod trsh;

pub use ess::{JobType, LevelOfTheory, Software};
pub use geometry::Geometry;
pub use status::{JobStatus, JobStatusVerdict};
pub use trsh::{next_remedy, RemedyDecision, TrshHistory, TrshRequest};
