//! Built-in help for the esstrsh command line.
//!
//! Topics: error keywords, remedy chains, request files and examples.

use crate::ess::Software;
use crate::trsh::remedy_chain;

/// Documentation entry for one error keyword.
#[derive(Debug, Clone)]
pub struct KeywordDoc {
    /// Keyword as it appears in a verdict
    pub name: &'static str,
    /// Software whose logs produce it
    pub software: &'static [&'static str],
    /// What the keyword means
    pub description: &'static str,
}

/// Error keywords reference, most common first.
pub const KEYWORDS: &[KeywordDoc] = &[
    KeywordDoc {
        name: "NoOutput",
        software: &["all"],
        description: "The log is missing, unreadable or shorter than 5 lines",
    },
    KeywordDoc {
        name: "Unknown",
        software: &["all"],
        description: "The job ended without normal termination and no known error pattern",
    },
    KeywordDoc {
        name: "Unconverged",
        software: &["Gaussian"],
        description: "Generic non-convergence; accompanies most Gaussian link errors",
    },
    KeywordDoc {
        name: "GL9999",
        software: &["Gaussian"],
        description: "Link 9999: optimization or SCF did not converge",
    },
    KeywordDoc {
        name: "SCF",
        software: &["Gaussian", "QChem", "Orca"],
        description: "SCF failed to converge (Gaussian l502, QChem SCF failure, diverging Orca SCF)",
    },
    KeywordDoc {
        name: "MaxOptCycles",
        software: &["Gaussian", "QChem", "Orca"],
        description: "The geometry optimization ran out of cycles",
    },
    KeywordDoc {
        name: "InternalCoordinateError",
        software: &["Gaussian"],
        description: "Link 103: bad internal coordinates, retried in Cartesians",
    },
    KeywordDoc {
        name: "CheckFile",
        software: &["Gaussian"],
        description: "The checkpoint file is corrupt or unreadable",
    },
    KeywordDoc {
        name: "Memory",
        software: &["Gaussian", "Orca", "Molpro"],
        description: "The job ran out of memory, or Orca needs more per core",
    },
    KeywordDoc {
        name: "max_total_job_memory",
        software: &["Orca"],
        description: "Orca reported the total memory it needs; cores are reduced to fit",
    },
    KeywordDoc {
        name: "cpu",
        software: &["Orca"],
        description: "Orca has fewer electron pairs than cores",
    },
    KeywordDoc {
        name: "DiskSpace",
        software: &["Gaussian"],
        description: "Out of scratch disk space; not recoverable by a remedy",
    },
    KeywordDoc {
        name: "BasisSet",
        software: &["Gaussian"],
        description: "The basis set does not cover an element; not recoverable by a remedy",
    },
    KeywordDoc {
        name: "Syntax",
        software: &["Gaussian", "Orca"],
        description: "The ESS rejected the input",
    },
    KeywordDoc {
        name: "MDCI",
        software: &["Orca"],
        description: "The coupled cluster step failed",
    },
    KeywordDoc {
        name: "MissingBasisSet",
        software: &["TeraChem"],
        description: "TeraChem lacks the requested basis set",
    },
];

/// Print global help
pub fn print_global_help() {
    println!("esstrsh - Troubleshooting of electronic structure software jobs");
    println!();
    println!("USAGE:");
    println!("    esstrsh [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    status <log> [software] [job_type] [label]");
    println!("                        Classify a job log; the software is detected if omitted");
    println!();
    println!("    trsh <request.json>");
    println!("                        Select the next remedy for an errored job");
    println!();
    println!("    scan <request.json>");
    println!("                        Check the quality of a rotor scan");
    println!();
    println!("    freq <log> [--rotors] [tried_freq ...]");
    println!("                        Perturb a geometry along its negative frequency modes");
    println!();
    println!("    server <server> <job_name> <job_id> <status> <remote_path> [tried_node ...]");
    println!("                        Delete a failed job and pick a node to resubmit it on");
    println!();
    println!("    ci esstrsh_config.cfg");
    println!("                        Create a configuration template file");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help [topic]   Show help. Topics: keywords, remedies, requests, examples");
    println!();
    println!("CONFIGURATION FILE:");
    println!("    Looked up in ./esstrsh_config.cfg, ~/.config/esstrsh/ and /etc/esstrsh/.");
    println!("    Holds scan thresholds, available ESS, the log level and the server table.");
    println!();
    println!("All results are printed as JSON on stdout; logs go to stderr.");
    println!();
}

/// Print error keyword reference
pub fn print_keyword_help() {
    println!("ERROR KEYWORD REFERENCE");
    println!("{}", "═".repeat(72));
    println!();
    for keyword in KEYWORDS {
        println!("{}", keyword.name);
        println!("    {}", keyword.description);
        println!("    Software: {}", keyword.software.join(", "));
        println!();
    }
}

/// Print the remedy chain of every software, in the order remedies are tried.
pub fn print_remedy_help() {
    println!("REMEDY CHAINS");
    println!("{}", "═".repeat(72));
    println!();
    for software in Software::ALL {
        println!("{}", software.display_name());
        println!("{}", "─".repeat(72));
        match remedy_chain(software.as_str()) {
            Ok(chain) if !chain.rules().is_empty() => {
                for (i, rule) in chain.rules().iter().enumerate() {
                    println!("  {:>2}. {}", i + 1, rule.tag);
                }
            }
            _ => println!("  No automated remedies"),
        }
        println!();
    }
    println!("Each remedy is tried at most once per job; the job is invalidated when");
    println!("every applicable remedy was tried.");
    println!();
}

/// Print the request file formats
pub fn print_request_help() {
    println!("REQUEST FILES");
    println!("{}", "═".repeat(72));
    println!();
    println!("trsh request:");
    println!(
        r#"    {{
      "label": "ethanol",
      "log": "opt_a12/output.log",
      "software": "gaussian",
      "job_type": "opt",
      "level_of_theory": {{"method": "wb97xd", "basis": "def2-tzvp"}},
      "history": ["int=(Acc2E=14)"],
      "server": "c1",
      "resources": {{"memory_gb": 16, "cpu_cores": 8}},
      "num_heavy_atoms": 3
    }}"#
    );
    println!("    \"log\" is classified when no \"verdict\" object is given.");
    println!("    \"server\" is either a name from the configuration or a full object.");
    println!();
    println!("scan request:");
    println!(
        r#"    {{
      "label": "ethanol",
      "pivots": [0, 1],
      "energies": [0.0, 3.1, 8.9, 3.2, 0.1],
      "scan_res": 8.0,
      "used_methods": [["inc_res"]],
      "bonds": [[0, 1], [1, 2]]
    }}"#
    );
    println!("    \"bonds\" lets TS scans check preserved dihedrals; atoms are zero-based.");
    println!("    \"scan_res\" defaults to rotor_scan_resolution from the configuration.");
    println!();
}

/// Print usage examples
pub fn print_examples() {
    println!("EXAMPLES");
    println!("{}", "═".repeat(72));
    println!();
    println!("    esstrsh status opt_a12/output.log");
    println!("    esstrsh status opt_a12/output.out orca opt ethanol");
    println!("    esstrsh trsh request.json > decision.json");
    println!("    esstrsh scan scan_request.json");
    println!("    esstrsh freq freq_a3/output.log -- -253.43");
    println!("    esstrsh server c1 opt_a12 81734 errored /home/u/runs/opt_a12 18");
    println!("    esstrsh ci esstrsh_config.cfg");
    println!();
}
