//! Configuration management for esstrsh.
//!
//! Settings are read from INI files with the following precedence, later
//! entries being overridden by earlier ones:
//!
//! 1. Local configuration (`./esstrsh_config.cfg`)
//! 2. User configuration (`~/.config/esstrsh/esstrsh_config.cfg`)
//! 3. System configuration (`/etc/esstrsh/esstrsh_config.cfg`)
//! 4. Built-in defaults
//!
//! # Configuration File Format
//!
//! ```ini
//! [scan]
//! inconsistency_az = 5.0
//! inconsistency_ab = 0.3
//! maximum_barrier = 40.0
//! rotor_scan_resolution = 8.0
//! preserve_param_in_scan_ratio = 0.1
//!
//! [ess]
//! available = gaussian, qchem, orca
//!
//! [logging]
//! level = info
//!
//! [server.c1]
//! cluster_soft = OGE
//! memory = 256
//! address = server1.host.edu
//! un = username
//! ```
//!
//! Every `[server.<name>]` section registers one server. A `local` server
//! always exists, even if no section describes it.

use configparser::ini::Ini;
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// File name looked up in every configuration directory.
pub const CONFIG_FILENAME: &str = "esstrsh_config.cfg";

const SERVER_SECTION_PREFIX: &str = "server.";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    /// Missing required configuration section
    #[error("Missing required section: {0}")]
    MissingSection(String),
}

/// Queueing system of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSoft {
    /// Oracle Grid Engine
    Oge,
    /// Slurm Workload Manager
    Slurm,
    /// Portable Batch System
    Pbs,
    /// No scheduler, jobs run as local processes
    Local,
}

impl ClusterSoft {
    /// Shell command deleting a job, to be followed by the job ID.
    pub fn delete_command(&self) -> &'static str {
        match self {
            ClusterSoft::Oge => "export SGE_ROOT=/opt/sge; /opt/sge/bin/lx24-amd64/qdel",
            ClusterSoft::Slurm => "/usr/bin/scancel",
            ClusterSoft::Pbs => "/opt/pbs/bin/qdel",
            ClusterSoft::Local => "kill",
        }
    }

    /// Shell command listing the nodes able to take a job.
    ///
    /// Each output line starts with the node's host name.
    pub fn list_available_nodes_command(&self) -> Option<&'static str> {
        match self {
            ClusterSoft::Oge => Some(
                "export SGE_ROOT=/opt/sge; /opt/sge/bin/lx24-amd64/qstat -f | grep \"/8 \" | grep \"long\" | grep -v \"8/8\"| grep -v \"aAu\"",
            ),
            ClusterSoft::Slurm => Some("sinfo -o \"%n %t %O %E\""),
            ClusterSoft::Pbs => Some("pbsnodes"),
            ClusterSoft::Local => None,
        }
    }

    /// Name of the submit script in a job's remote folder.
    pub fn submit_filename(&self) -> &'static str {
        match self {
            ClusterSoft::Slurm => "submit.sl",
            _ => "submit.sh",
        }
    }
}

impl fmt::Display for ClusterSoft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterSoft::Oge => "OGE",
            ClusterSoft::Slurm => "Slurm",
            ClusterSoft::Pbs => "PBS",
            ClusterSoft::Local => "local",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ClusterSoft {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "oge" | "sge" => Ok(ClusterSoft::Oge),
            "slurm" => Ok(ClusterSoft::Slurm),
            "pbs" => Ok(ClusterSoft::Pbs),
            "local" | "none" => Ok(ClusterSoft::Local),
            other => Err(ConfigError::InvalidValue(format!(
                "Unknown cluster software: {}",
                other
            ))),
        }
    }
}

/// Capabilities and connection details of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name, as used in the `[server.<name>]` section
    pub name: String,
    /// Queueing system
    pub cluster_soft: ClusterSoft,
    /// Maximum memory of a node in GB, if known
    #[serde(default)]
    pub memory: Option<f64>,
    /// Host name or address
    #[serde(default)]
    pub address: Option<String>,
    /// User name on the server
    #[serde(default)]
    pub user: Option<String>,
}

impl ServerConfig {
    /// The implicit local server.
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            cluster_soft: ClusterSoft::Local,
            memory: None,
            address: None,
            user: None,
        }
    }

    /// Whether jobs on this server run on this machine.
    pub fn is_local(&self) -> bool {
        self.name == "local" || self.cluster_soft == ClusterSoft::Local
    }
}

/// Rotor scan quality thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanThresholds {
    /// Allowed energy difference between the first and last scan points, kJ/mol
    pub inconsistency_az: f64,
    /// Allowed jump between consecutive points, as a fraction of the maximal energy
    pub inconsistency_ab: f64,
    /// Maximal barrier for a hindered rotor, kJ/mol
    pub maximum_barrier: f64,
    /// Default scan resolution in degrees
    pub rotor_scan_resolution: f64,
    /// Allowed relative change of a preserved parameter along the scan
    pub preserve_param_in_scan_ratio: f64,
}

impl Default for ScanThresholds {
    fn default() -> Self {
        Self {
            inconsistency_az: 5.0,
            inconsistency_ab: 0.3,
            maximum_barrier: 40.0,
            rotor_scan_resolution: 8.0,
            preserve_param_in_scan_ratio: 0.1,
        }
    }
}

/// ESS availability settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EssSettings {
    /// ESS installed on the servers. Empty means no restriction.
    pub available: Vec<String>,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration structure containing all program settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Rotor scan thresholds
    pub scan: ScanThresholds,
    /// ESS availability
    pub ess: EssSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
    /// Known servers by name
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut servers = BTreeMap::new();
        servers.insert("local".to_string(), ServerConfig::local());
        Self {
            scan: ScanThresholds::default(),
            ess: EssSettings::default(),
            logging: LoggingSettings::default(),
            servers,
        }
    }
}

/// Configuration manager that handles loading and accessing program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads configuration from the available configuration files.
    ///
    /// Files that fail to parse are skipped with a warning, so this only
    /// fails if building the defaults fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use esstrsh::settings::SettingsManager;
    ///
    /// let settings = SettingsManager::load()?;
    /// println!("Configuration loaded from: {}", settings.config_source());
    /// # Ok::<(), esstrsh::settings::ConfigError>(())
    /// ```
    pub fn load() -> Result<Self, ConfigError> {
        let (settings, source) = Self::load_from_files()?;
        info!("Configuration loaded from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
        })
    }

    /// Loads configuration from a single file on top of the built-in defaults.
    ///
    /// # Errors
    ///
    /// Unlike [`SettingsManager::load`], a file that cannot be read or
    /// parsed is an error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        Self::load_config(path, &mut settings)?;
        Ok(Self {
            settings,
            config_source: format!("file ({})", path.display()),
        })
    }

    /// Returns the source of the loaded configuration.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the scan thresholds.
    pub fn scan(&self) -> &ScanThresholds {
        &self.settings.scan
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    /// Maps the configured log level onto a [`LevelFilter`], `Info` if unknown.
    pub fn log_level(&self) -> LevelFilter {
        LevelFilter::from_str(&self.settings.logging.level).unwrap_or(LevelFilter::Info)
    }

    /// Available ESS, `None` when no restriction was configured.
    pub fn available_ess(&self) -> Option<Vec<String>> {
        if self.settings.ess.available.is_empty() {
            None
        } else {
            Some(self.settings.ess.available.clone())
        }
    }

    /// Looks up a server by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.settings.servers.get(name)
    }

    /// Loads configuration from files with hierarchical precedence.
    fn load_from_files() -> Result<(Settings, String), ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        let candidates = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from(CONFIG_FILENAME))),
        ];
        for (kind, path) in candidates {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            match Self::load_config(&path, &mut settings) {
                Ok(()) => {
                    config_source = format!("{} config ({})", kind, path.display());
                    debug!("Loaded {} configuration from: {}", kind, path.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to load {} config from {}: {}",
                        kind,
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok((settings, config_source))
    }

    /// Applies one INI file onto `settings`.
    ///
    /// The file is fully parsed before anything is applied, so a bad value
    /// leaves `settings` untouched.
    fn load_config(path: &Path, settings: &mut Settings) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        let map = ini
            .read(content)
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;

        let mut updated = settings.clone();
        if let Some(section) = map.get("scan") {
            Self::parse_scan(section, &mut updated.scan)?;
        }
        if let Some(section) = map.get("ess") {
            if let Some(Some(available)) = section.get("available") {
                updated.ess.available = available
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
        if let Some(section) = map.get("logging") {
            if let Some(Some(level)) = section.get("level") {
                updated.logging.level = level.clone();
            }
        }
        for (name, section) in &map {
            if let Some(server_name) = name.strip_prefix(SERVER_SECTION_PREFIX) {
                let server = Self::parse_server(server_name, section)?;
                updated.servers.insert(server_name.to_string(), server);
            }
        }

        *settings = updated;
        Ok(())
    }

    fn parse_scan(
        section: &HashMap<String, Option<String>>,
        scan: &mut ScanThresholds,
    ) -> Result<(), ConfigError> {
        let fields: [(&str, &mut f64); 5] = [
            ("inconsistency_az", &mut scan.inconsistency_az),
            ("inconsistency_ab", &mut scan.inconsistency_ab),
            ("maximum_barrier", &mut scan.maximum_barrier),
            ("rotor_scan_resolution", &mut scan.rotor_scan_resolution),
            (
                "preserve_param_in_scan_ratio",
                &mut scan.preserve_param_in_scan_ratio,
            ),
        ];
        for (key, slot) in fields {
            if let Some(Some(raw)) = section.get(key) {
                *slot = raw.trim().parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("Invalid {}: {}", key, raw))
                })?;
            }
        }
        Ok(())
    }

    fn parse_server(
        name: &str,
        section: &HashMap<String, Option<String>>,
    ) -> Result<ServerConfig, ConfigError> {
        let cluster_soft = match section.get("cluster_soft") {
            Some(Some(raw)) => raw.parse()?,
            _ if name == "local" => ClusterSoft::Local,
            _ => {
                return Err(ConfigError::MissingSection(format!(
                    "server.{}: cluster_soft",
                    name
                )))
            }
        };
        let memory = match section.get("memory") {
            Some(Some(raw)) => Some(raw.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!("Invalid memory for server {}: {}", name, raw))
            })?),
            _ => None,
        };
        let text = |key: &str| section.get(key).cloned().flatten();
        Ok(ServerConfig {
            name: name.to_string(),
            cluster_soft,
            memory,
            address: text("address"),
            user: text("un"),
        })
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/esstrsh").join(CONFIG_FILENAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("esstrsh").join(CONFIG_FILENAME))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("esstrsh")
                    .join(CONFIG_FILENAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("esstrsh").join(CONFIG_FILENAME))
        }
    }
}

impl SettingsManager {
    /// Writes a commented configuration template holding the defaults.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use esstrsh::settings::SettingsManager;
    /// use std::path::Path;
    ///
    /// SettingsManager::create_template(Path::new("esstrsh_config.cfg"))?;
    /// # Ok::<(), esstrsh::settings::ConfigError>(())
    /// ```
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let scan = ScanThresholds::default();
        format!(
            r#"# esstrsh Configuration File
#
# Files are looked up in this order, the first one taking precedence:
#
# 1. ./{file}
# 2. ~/.config/esstrsh/{file}
# 3. /etc/esstrsh/{file}
# 4. Built-in defaults
#
# Missing sections or values keep the built-in defaults shown below.

[scan]
# Allowed energy difference between the first and last scan points (kJ/mol)
inconsistency_az = {az}

# Allowed jump between consecutive points, as a fraction of the maximal energy
inconsistency_ab = {ab}

# Maximal barrier for a hindered rotor (kJ/mol); higher barriers are not rotors
maximum_barrier = {barrier}

# Default rotor scan resolution (degrees)
rotor_scan_resolution = {res}

# Allowed relative change of a preserved distance along a scan
preserve_param_in_scan_ratio = {ratio}

[ess]
# Comma-separated ESS installed on your servers, e.g. gaussian, qchem, orca, molpro, terachem
# Leave empty to allow switching to any ESS.
available =

[logging]
# Log level: error, warn, info, debug, trace (default: info)
level = {level}

# One section per server. cluster_soft is one of OGE, Slurm, PBS, local.
# memory is the maximal memory of a node in GB; if missing, {default_mem} GB is assumed.
#
# [server.c1]
# cluster_soft = OGE
# memory = 256
# address = server1.host.edu
# un = username
"#,
            file = CONFIG_FILENAME,
            az = scan.inconsistency_az,
            ab = scan.inconsistency_ab,
            barrier = scan.maximum_barrier,
            res = scan.rotor_scan_resolution,
            ratio = scan.preserve_param_in_scan_ratio,
            level = LoggingSettings::default().level,
            default_mem = crate::trsh::DEFAULT_MAX_NODE_MEMORY_GB,
        )
    }
}
