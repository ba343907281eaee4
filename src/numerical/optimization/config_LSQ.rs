//! Solver settings read from a TOML document.
//!
//! ```toml
//! [levenberg_marquardt]
//! initial_step_bound_factor = 100.0
//! cost_relative_tolerance = 1e-10
//! par_relative_tolerance = 1e-10
//! ortho_tolerance = 1e-10
//! qr_ranking_threshold = 1e-300
//!
//! [gauss_newton]
//! decomposition = "QR"
//! relative_threshold = 1e-10
//! absolute_threshold = 1e-12
//!
//! [problem]
//! max_evaluations = 500
//!
//! [logging]
//! level = "debug"
//! console = true
//! file = "auto"
//! ```
//! Every section and every key is optional, missing ones keep their defaults.
use crate::Utils::logger::{LogFile, init_logger};
use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::gauss_newton::DecompositionMethod;
use crate::numerical::optimization::problem_LSQ::DEFAULT_MAX_EVALUATIONS;
use log::{LevelFilter, warn};
use std::path::Path;
use std::str::FromStr;
use toml::{Table, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct LMSettings {
    pub initial_step_bound_factor: f64,
    pub cost_relative_tolerance: f64,
    pub par_relative_tolerance: f64,
    pub ortho_tolerance: f64,
    pub qr_ranking_threshold: f64,
}

impl Default for LMSettings {
    fn default() -> Self {
        Self {
            initial_step_bound_factor: 100.0,
            cost_relative_tolerance: 1e-10,
            par_relative_tolerance: 1e-10,
            ortho_tolerance: 1e-10,
            qr_ranking_threshold: f64::MIN_POSITIVE,
        }
    }
}

/// Gauss-Newton settings. The thresholds configure the
/// `SimpleVectorValueChecker` the solver is built with.
#[derive(Debug, Clone, PartialEq)]
pub struct GNSettings {
    pub decomposition: DecompositionMethod,
    pub relative_threshold: f64,
    pub absolute_threshold: f64,
}

impl Default for GNSettings {
    fn default() -> Self {
        Self {
            decomposition: DecompositionMethod::LU,
            relative_threshold: 1e-10,
            absolute_threshold: 1e-12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub console: bool,
    pub file: LogFile,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            console: true,
            file: LogFile::Disabled,
        }
    }
}

impl LoggingSettings {
    /// Install the global logger described by these settings.
    pub fn init(&self) -> LSQResult<bool> {
        Ok(init_logger(self.level, self.console, &self.file)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    pub levenberg_marquardt: LMSettings,
    pub gauss_newton: GNSettings,
    pub max_evaluations: usize,
    pub logging: LoggingSettings,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            levenberg_marquardt: LMSettings::default(),
            gauss_newton: GNSettings::default(),
            max_evaluations: DEFAULT_MAX_EVALUATIONS,
            logging: LoggingSettings::default(),
        }
    }
}

fn invalid(section: &str, key: &str, expected: &str, found: &Value) -> OptimizationError {
    OptimizationError::InvalidConfig(format!(
        "[{}] {}: expected {}, found {}",
        section,
        key,
        expected,
        found.type_str()
    ))
}

fn section<'a>(root: &'a Table, name: &str) -> LSQResult<Option<&'a Table>> {
    match root.get(name) {
        None => Ok(None),
        Some(Value::Table(t)) => Ok(Some(t)),
        Some(other) => Err(invalid(name, "", "a table", other)),
    }
}

fn get_f64(table: &Table, section: &str, key: &str) -> LSQResult<Option<f64>> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::Float(f)) => Ok(Some(*f)),
        Some(Value::Integer(i)) => Ok(Some(*i as f64)),
        Some(other) => Err(invalid(section, key, "a number", other)),
    }
}

fn get_non_negative(table: &Table, section: &str, key: &str) -> LSQResult<Option<f64>> {
    let value = get_f64(table, section, key)?;
    if let Some(v) = value {
        if !(v >= 0.0) || !v.is_finite() {
            return Err(OptimizationError::InvalidConfig(format!(
                "[{}] {} must be a finite non-negative number, got {}",
                section, key, v
            )));
        }
    }
    Ok(value)
}

fn get_str<'a>(table: &'a Table, section: &str, key: &str) -> LSQResult<Option<&'a str>> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(section, key, "a string", other)),
    }
}

fn get_bool(table: &Table, section: &str, key: &str) -> LSQResult<Option<bool>> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::Boolean(b)) => Ok(Some(*b)),
        Some(other) => Err(invalid(section, key, "a boolean", other)),
    }
}

fn warn_unknown_keys(table: &Table, section: &str, known: &[&str]) {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            warn!("unknown key [{}] {} ignored", section, key);
        }
    }
}

impl SolverSettings {
    pub fn from_toml_str(text: &str) -> LSQResult<Self> {
        let root: Table = text
            .parse()
            .map_err(|e: toml::de::Error| OptimizationError::InvalidConfig(e.to_string()))?;
        let mut settings = SolverSettings::default();

        if let Some(lm) = section(&root, "levenberg_marquardt")? {
            let name = "levenberg_marquardt";
            warn_unknown_keys(
                lm,
                name,
                &[
                    "initial_step_bound_factor",
                    "cost_relative_tolerance",
                    "par_relative_tolerance",
                    "ortho_tolerance",
                    "qr_ranking_threshold",
                ],
            );
            let s = &mut settings.levenberg_marquardt;
            if let Some(v) = get_non_negative(lm, name, "initial_step_bound_factor")? {
                if v == 0.0 {
                    return Err(OptimizationError::InvalidConfig(
                        "[levenberg_marquardt] initial_step_bound_factor must be > 0".to_string(),
                    ));
                }
                s.initial_step_bound_factor = v;
            }
            if let Some(v) = get_non_negative(lm, name, "cost_relative_tolerance")? {
                s.cost_relative_tolerance = v;
            }
            if let Some(v) = get_non_negative(lm, name, "par_relative_tolerance")? {
                s.par_relative_tolerance = v;
            }
            if let Some(v) = get_non_negative(lm, name, "ortho_tolerance")? {
                s.ortho_tolerance = v;
            }
            if let Some(v) = get_non_negative(lm, name, "qr_ranking_threshold")? {
                s.qr_ranking_threshold = v;
            }
        }

        if let Some(gn) = section(&root, "gauss_newton")? {
            let name = "gauss_newton";
            warn_unknown_keys(
                gn,
                name,
                &["decomposition", "relative_threshold", "absolute_threshold"],
            );
            let s = &mut settings.gauss_newton;
            if let Some(method) = get_str(gn, name, "decomposition")? {
                s.decomposition = DecompositionMethod::from_str(&method.to_uppercase())
                    .map_err(|_| {
                        OptimizationError::InvalidConfig(format!(
                            "[gauss_newton] decomposition must be LU or QR, got {}",
                            method
                        ))
                    })?;
            }
            if let Some(v) = get_non_negative(gn, name, "relative_threshold")? {
                s.relative_threshold = v;
            }
            if let Some(v) = get_non_negative(gn, name, "absolute_threshold")? {
                s.absolute_threshold = v;
            }
        }

        if let Some(problem) = section(&root, "problem")? {
            warn_unknown_keys(problem, "problem", &["max_evaluations"]);
            match problem.get("max_evaluations") {
                None => {}
                Some(Value::Integer(i)) if *i > 0 => settings.max_evaluations = *i as usize,
                Some(Value::Integer(i)) => {
                    return Err(OptimizationError::InvalidConfig(format!(
                        "[problem] max_evaluations must be > 0, got {}",
                        i
                    )));
                }
                Some(other) => {
                    return Err(invalid("problem", "max_evaluations", "an integer", other));
                }
            }
        }

        if let Some(logging) = section(&root, "logging")? {
            let name = "logging";
            warn_unknown_keys(logging, name, &["level", "console", "file"]);
            let s = &mut settings.logging;
            if let Some(level) = get_str(logging, name, "level")? {
                s.level = LevelFilter::from_str(level).map_err(|_| {
                    OptimizationError::InvalidConfig(format!(
                        "[logging] level must be off, error, warn, info, debug or trace, got {}",
                        level
                    ))
                })?;
            }
            if let Some(console) = get_bool(logging, name, "console")? {
                s.console = console;
            }
            if let Some(file) = get_str(logging, name, "file")? {
                s.file = match file {
                    "" | "none" => LogFile::Disabled,
                    "auto" => LogFile::Timestamped,
                    path => LogFile::Named(path.to_string()),
                };
            }
        }

        Ok(settings)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> LSQResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
