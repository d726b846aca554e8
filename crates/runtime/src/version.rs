//! Checks the installed accelerator stack against the validated release.
//!
//! Two probes run through the shell: the package lister (for the framework
//! plugin) and the driver query tool. Their output is plain text; the parsing
//! functions below are pure so they can be tested on captured output.
//! Mismatches and missing tools are reported as warnings only.

use std::{fmt, process::Command, str::FromStr};

use crate::RuntimeError;

/// Release the workspace has been validated against.
pub const VALIDATED_RUNTIME_VERSION: Version = Version::new(1, 9, 0);

/// `major.minor.patch`, anything after `-` or `+` is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Releases are compatible when major and minor agree.
    pub fn same_release(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        if core.is_empty() {
            return Err(RuntimeError::parse("version", format!("empty version in {s:?}")));
        }
        let mut parts = [0u64; 3];
        for (idx, piece) in core.split('.').enumerate() {
            if idx >= parts.len() {
                break;
            }
            parts[idx] = piece
                .parse()
                .map_err(|err| RuntimeError::parse("version", format!("{s:?}: {err}")))?;
        }
        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

/// Where to look for versions and what to compare them with.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Package whose version stands for the installed framework.
    pub package: String,
    /// Driver query tool; its third output line carries the driver version.
    pub driver_command: String,
    pub validated: Version,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            package: "habana-torch-plugin".to_string(),
            driver_command: "hl-smi".to_string(),
            validated: VALIDATED_RUNTIME_VERSION,
        }
    }
}

/// Result of [`check_runtime_versions`], after warnings have been logged.
#[derive(Debug, Clone, Default)]
pub struct VersionReport {
    pub framework: Option<Version>,
    pub driver: Option<Version>,
    pub warnings: Vec<String>,
}

/// Parses `pip list` style output: last column of the first line.
pub fn parse_package_listing(stdout: &str) -> Result<Version, RuntimeError> {
    let first = stdout.lines().next().unwrap_or_default();
    let field = first
        .split_whitespace()
        .last()
        .ok_or_else(|| RuntimeError::parse("package listing", "no package line"))?;
    field.parse()
}

/// Parses the driver tool banner, e.g. `| Driver Version:   1.9.0-e5d6d14   |`
/// on the third line.
pub fn parse_driver_report(stdout: &str) -> Result<Version, RuntimeError> {
    let line = stdout
        .lines()
        .nth(2)
        .ok_or_else(|| RuntimeError::parse("driver report", "fewer than three lines"))?;
    let compact: String = line.chars().filter(|c| *c != ' ').collect();
    let value = compact
        .split(':')
        .nth(1)
        .ok_or_else(|| RuntimeError::parse("driver report", format!("no ':' in {line:?}")))?;
    let mut chars = value.chars();
    chars.next_back();
    chars.as_str().parse()
}

/// Installed framework version, `None` when it cannot be determined.
pub fn framework_version(config: &ProbeConfig) -> Option<Version> {
    let command = format!("pip list | grep {}", config.package);
    let output = match Command::new("sh").arg("-c").arg(&command).output() {
        Ok(output) => output,
        Err(source) => {
            log::debug!(
                "{}",
                RuntimeError::Command {
                    command,
                    source
                }
            );
            return None;
        }
    };
    match parse_package_listing(&String::from_utf8_lossy(&output.stdout)) {
        Ok(version) => Some(version),
        Err(err) => {
            log::debug!("{err}");
            None
        }
    }
}

/// Driver version, `None` when the tool is missing or exits non-zero.
pub fn driver_version(config: &ProbeConfig) -> Option<Version> {
    let output = match Command::new(&config.driver_command).output() {
        Ok(output) => output,
        Err(source) => {
            log::debug!(
                "{}",
                RuntimeError::Command {
                    command: config.driver_command.clone(),
                    source
                }
            );
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    parse_driver_report(&String::from_utf8_lossy(&output.stdout)).ok()
}

/// Compares probed versions with `validated` and returns the warnings to emit.
pub fn evaluate_versions(
    config: &ProbeConfig,
    framework: Option<Version>,
    driver: Option<Version>,
) -> Vec<String> {
    let validated = config.validated;
    let mut warnings = Vec::new();
    match framework {
        Some(found) if !found.same_release(&validated) => warnings.push(format!(
            "validated for runtime v{validated} but {} v{found} was found, this could lead to undefined behavior",
            config.package
        )),
        Some(_) => {}
        None => warnings.push(format!(
            "could not determine the installed {} version",
            config.package
        )),
    }
    match driver {
        Some(found) if !found.same_release(&validated) => warnings.push(format!(
            "validated for runtime v{validated} but the driver version is v{found}, this could lead to undefined behavior"
        )),
        Some(_) => {}
        None => warnings.push(format!(
            "could not run `{}`, please check the driver installation",
            config.driver_command
        )),
    }
    warnings
}

/// Probes both versions and logs a warning for every mismatch.
pub fn check_runtime_versions(config: &ProbeConfig) -> VersionReport {
    let framework = framework_version(config);
    let driver = driver_version(config);
    let warnings = evaluate_versions(config, framework, driver);
    for warning in &warnings {
        log::warn!("{warning}");
    }
    VersionReport {
        framework,
        driver,
        warnings,
    }
}
