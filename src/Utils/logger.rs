use chrono::Local;
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::io;

/// Where the file logger writes
#[derive(Debug, Clone, PartialEq)]
pub enum LogFile {
    /// no file logger
    Disabled,
    /// `log_<date>_<time>.txt` in the working directory
    Timestamped,
    Named(String),
}

/// `log_YYYY-MM-DD_HH-MM-SS.txt`
pub fn default_log_file_name() -> String {
    let date_and_time = Local::now().format("%Y-%m-%d_%H-%M-%S");
    format!("log_{}.txt", date_and_time)
}

/// Install a global `simplelog` logger (terminal and/or file).
///
/// Returns `Ok(false)` if a logger was already installed in this process,
/// the existing logger is left untouched in that case.
pub fn init_logger(level: LevelFilter, console: bool, file: &LogFile) -> io::Result<bool> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    // Console logger
    if console {
        loggers.push(TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }

    // File logger
    let filename = match file {
        LogFile::Disabled => None,
        LogFile::Timestamped => Some(default_log_file_name()),
        LogFile::Named(name) => Some(name.clone()),
    };
    if let Some(filename) = filename {
        let file = File::create(filename)?;
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }

    if loggers.is_empty() {
        return Ok(false);
    }
    Ok(CombinedLogger::init(loggers).is_ok())
}
