//! esstrsh Command-Line Interface
//!
//! Entry point of the `esstrsh` binary. Every command reads a log or a JSON
//! request, runs one troubleshooting step and prints the result as JSON.
//!
//! # Examples
//!
//! ```bash
//! # Classify a log, detecting the software
//! esstrsh status opt_a12/output.log
//!
//! # Pick the next remedy for an errored job
//! esstrsh trsh request.json
//!
//! # Create a configuration template
//! esstrsh ci esstrsh_config.cfg
//! ```
//!
//! Built-in help: `esstrsh --help [keywords|remedies|requests|examples]`.

use esstrsh::ess::{JobType, Software};
use esstrsh::freq::trsh_negative_freq;
use esstrsh::parser::GaussianFrequencySource;
use esstrsh::scan::{scan_quality_check, AdjacencyGraph, MoleculeGraph, ScanCheck, WellCounter};
use esstrsh::server::{trsh_job_on_server, LocalExecutor, RemoteExecutor, ServerError, SshExecutor};
use esstrsh::settings::{SettingsManager, CONFIG_FILENAME};
use esstrsh::status::determine_ess_status;
use esstrsh::trsh::{next_remedy, TrshRequest};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::process;

type CliResult = Result<(), Box<dyn Error>>;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }
    check_help_flags(&args);

    let settings = match SettingsManager::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    // JSON goes to stdout, so logs go to stderr.
    env_logger::Builder::from_default_env()
        .filter_level(settings.log_level())
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .init();
    info!("Configuration loaded from: {}", settings.config_source());

    let command = args[1].as_str();
    let rest = &args[2..];
    let result = match command {
        "status" => run_status(rest),
        "trsh" => run_trsh(rest, &settings),
        "scan" => run_scan(rest, &settings),
        "freq" => run_freq(rest),
        "server" => run_server(rest, &settings),
        "ci" => run_create_settings_template(rest),
        _ => {
            eprintln!("Error: Unknown command: {}", command);
            print_usage(&args[0]);
            process::exit(1);
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Check for help flags and print appropriate help
fn check_help_flags(args: &[String]) {
    use esstrsh::help::*;

    let is_help = |arg: &str| arg == "--help" || arg == "-h";
    if is_help(&args[1]) {
        match args.get(2).map(String::as_str) {
            Some("keywords") => print_keyword_help(),
            Some("remedies") => print_remedy_help(),
            Some("requests") => print_request_help(),
            Some("examples") => print_examples(),
            _ => print_global_help(),
        }
        process::exit(0);
    }
    if args.len() >= 3 && is_help(&args[2]) {
        print_global_help();
        process::exit(0);
    }
}

/// Prints usage information to stderr.
fn print_usage(program_name: &str) {
    eprintln!("esstrsh - Troubleshooting of electronic structure software jobs");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} status <log> [software] [job_type] [label]", program_name);
    eprintln!("  {} trsh <request.json>", program_name);
    eprintln!("  {} scan <request.json>", program_name);
    eprintln!("  {} freq <log> [--rotors] [tried_freq ...]", program_name);
    eprintln!(
        "  {} server <server> <job_name> <job_id> <status> <remote_path> [tried_node ...]",
        program_name
    );
    eprintln!("  {} ci {}", program_name, CONFIG_FILENAME);
    eprintln!();
    eprintln!("Run '{} --help' for details.", program_name);
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_status(args: &[String]) -> CliResult {
    let log = args.first().ok_or("Missing log file argument")?;
    let software = args.get(1).map(|s| s.parse::<Software>()).transpose()?;
    let job_type = match args.get(2) {
        Some(raw) => raw.parse::<JobType>()?,
        None => JobType::Opt,
    };
    let label = args.get(3).map(String::as_str).unwrap_or("species");
    let verdict = determine_ess_status(Path::new(log), label, job_type, software)?;
    print_json(&verdict)
}

/// Fills the parts of a trsh request that may be given by reference: the
/// verdict (from a `log` path), the server (by name) and the available ESS.
fn resolve_trsh_request(mut value: Value, settings: &SettingsManager) -> Result<TrshRequest, Box<dyn Error>> {
    let object = value.as_object_mut().ok_or("A trsh request must be a JSON object")?;

    if !object.contains_key("verdict") {
        let log = object
            .get("log")
            .and_then(Value::as_str)
            .ok_or("A trsh request needs a \"verdict\" or a \"log\"")?
            .to_string();
        let label = object.get("label").and_then(Value::as_str).unwrap_or("species").to_string();
        let software = object
            .get("software")
            .and_then(Value::as_str)
            .map(str::parse::<Software>)
            .transpose()?;
        let job_type: JobType = serde_json::from_value(object.get("job_type").cloned().unwrap_or(Value::Null))?;
        let verdict = determine_ess_status(Path::new(&log), &label, job_type, software)?;
        object.insert("verdict".to_string(), serde_json::to_value(verdict)?);
    }

    let server = match object.get("server") {
        None | Some(Value::Null) => Some("local".to_string()),
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => None,
    };
    if let Some(name) = server {
        let config = settings
            .server(&name)
            .ok_or_else(|| ServerError::UnknownServer(name.clone()))?;
        object.insert("server".to_string(), serde_json::to_value(config)?);
    }

    if matches!(object.get("available_ess"), None | Some(Value::Null)) {
        object.insert("available_ess".to_string(), serde_json::to_value(settings.available_ess())?);
    }

    Ok(serde_json::from_value(value)?)
}

fn run_trsh(args: &[String], settings: &SettingsManager) -> CliResult {
    let path = args.first().ok_or("Missing request file argument")?;
    let value: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let request = resolve_trsh_request(value, settings)?;
    let decision = next_remedy(&request)?;
    print_json(&decision)
}

/// A scan check with an optional bond list for the conformer check.
#[derive(Deserialize)]
struct ScanRequest {
    #[serde(flatten)]
    check: ScanCheck,
    #[serde(default)]
    bonds: Option<Vec<[usize; 2]>>,
}

fn run_scan(args: &[String], settings: &SettingsManager) -> CliResult {
    let path = args.first().ok_or("Missing request file argument")?;
    let request: ScanRequest = serde_json::from_str(&fs::read_to_string(path)?)?;
    let graph = request.bonds.as_deref().map(AdjacencyGraph::from_bonds);
    let verdict = scan_quality_check(
        &request.check,
        settings.scan(),
        &WellCounter::default(),
        graph.as_ref().map(|g| g as &dyn MoleculeGraph),
    );
    print_json(&verdict)
}

fn run_freq(args: &[String]) -> CliResult {
    let log = args.first().ok_or("Missing log file argument")?;
    let mut job_types = Vec::new();
    let mut tried = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "--rotors" => job_types.push("rotors".to_string()),
            "--" => {}
            raw => tried.push(
                raw.parse::<f64>()
                    .map_err(|_| format!("Invalid frequency: {}", raw))?,
            ),
        }
    }
    let label = Path::new(log)
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "species".to_string());
    let outcome = trsh_negative_freq(&label, Path::new(log), &tried, &job_types, &GaussianFrequencySource)?;
    print_json(&outcome)
}

fn run_server(args: &[String], settings: &SettingsManager) -> CliResult {
    if args.len() < 5 {
        return Err("Usage: server <server> <job_name> <job_id> <status> <remote_path> [tried_node ...]".into());
    }
    let server = settings
        .server(&args[0])
        .ok_or_else(|| ServerError::UnknownServer(args[0].clone()))?;
    let mut tried_nodes: Vec<String> = args[5..].to_vec();
    let executor: &dyn RemoteExecutor = if server.is_local() {
        &LocalExecutor
    } else {
        &SshExecutor
    };
    let recovery = trsh_job_on_server(server, &args[1], &args[2], &args[3], &args[4], &mut tried_nodes, executor)?;
    print_json(&serde_json::json!({
        "node": recovery.node,
        "resubmit": recovery.resubmit,
        "tried_nodes": tried_nodes,
    }))
}

fn run_create_settings_template(args: &[String]) -> CliResult {
    match args.first() {
        Some(name) if name == CONFIG_FILENAME => {}
        _ => return Err(format!("Usage: ci {}", CONFIG_FILENAME).into()),
    }
    let settings_path = Path::new(CONFIG_FILENAME);
    if settings_path.exists() {
        return Err(format!(
            "{} already exists. Please remove it first or choose a different location.",
            CONFIG_FILENAME
        )
        .into());
    }
    SettingsManager::create_template(settings_path)?;
    eprintln!("✓ Settings template created: {}", CONFIG_FILENAME);
    Ok(())
}
