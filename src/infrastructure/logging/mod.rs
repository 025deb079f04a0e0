//! Process-wide logging: `env_logger` on stderr, mirrored into a per-run file under
//! the data directory when file logging is on.

use chrono::Local;
use env_logger::Builder;
use log::{Level, LevelFilter, Record};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime};

const ENABLE_LOGS_ENV: &str = "ARBOR_ENABLE_LOGS";
const RETENTION_ENV: &str = "ARBOR_LOG_RETENTION_HOURS";
const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 3_600);

/// Set once by [`init_logging`]; `None` inside means file logging is off.
static LOG_SINK: OnceLock<Option<LogFile>> = OnceLock::new();

struct LogFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl LogFile {
    fn append(&self, line: &str) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }
}

#[derive(Debug, PartialEq)]
struct LoggingConfig {
    file_logging: bool,
    retention: Duration,
    warnings: Vec<String>,
}

impl LoggingConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut warnings = Vec::new();

        let mut file_logging = cfg!(debug_assertions);
        if let Some(raw) = lookup(ENABLE_LOGS_ENV) {
            match parse_bool(&raw) {
                Some(flag) => file_logging = flag,
                None => warnings.push(format!(
                    "Ignoring {ENABLE_LOGS_ENV}='{raw}', expected a boolean (file logging: {file_logging})"
                )),
            }
        }

        let retention = match lookup(RETENTION_ENV) {
            None => DEFAULT_RETENTION,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(hours) => Duration::from_secs(hours.saturating_mul(3_600)),
                Err(_) => {
                    warnings.push(format!(
                        "Ignoring {RETENTION_ENV}='{raw}', keeping logs for {}h",
                        DEFAULT_RETENTION.as_secs() / 3_600
                    ));
                    DEFAULT_RETENTION
                }
            },
        };

        Self {
            file_logging,
            retention,
            warnings,
        }
    }

    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

pub fn get_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("arbor")
        .join("logs")
}

/// Path of the active log file, if file logging was enabled at startup.
pub fn current_log_path() -> Option<PathBuf> {
    LOG_SINK
        .get()
        .and_then(|sink| sink.as_ref())
        .map(|file| file.path.clone())
}

fn log_file_name() -> String {
    format!("arbor-{}.log", Local::now().format("%Y%m%d-%H%M%S"))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn open_log_file(dir: &Path, retention: Duration, warnings: &mut Vec<String>) -> Option<LogFile> {
    if let Err(e) = fs::create_dir_all(dir) {
        warnings.push(format!("Cannot create log directory {}: {e}", dir.display()));
        return None;
    }
    warnings.extend(prune_logs(dir, retention));

    let path = dir.join(log_file_name());
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(LogFile {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        }),
        Err(e) => {
            warnings.push(format!(
                "Cannot open log file {}: {e}; logging to stderr only",
                path.display()
            ));
            None
        }
    }
}

/// Deletes `.log` files in `dir` older than `retention`. Zero retention keeps everything.
fn prune_logs(dir: &Path, retention: Duration) -> Vec<String> {
    let mut warnings = Vec::new();
    if retention.is_zero() {
        return warnings;
    }
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return warnings;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return warnings;
    };

    for path in entries.flatten().map(|entry| entry.path()) {
        let is_log = path.is_file() && path.extension().is_some_and(|ext| ext == "log");
        if !is_log {
            continue;
        }
        match fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) if modified < cutoff => {
                if let Err(e) = fs::remove_file(&path) {
                    warnings.push(format!("Cannot delete old log {}: {e}", path.display()));
                }
            }
            Ok(_) => {}
            Err(e) => warnings.push(format!("Cannot read age of {}: {e}", path.display())),
        }
    }
    warnings
}

fn format_line(record: &Record<'_>) -> String {
    let level = match record.level() {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    };
    format!(
        "[{} {level} {}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.target(),
        record.args()
    )
}

/// Installs the global logger. Later calls are no-ops.
pub fn init_logging() {
    if LOG_SINK.get().is_some() {
        return;
    }
    let LoggingConfig {
        file_logging,
        retention,
        mut warnings,
    } = LoggingConfig::from_env();

    let file = file_logging
        .then(|| open_log_file(&get_log_dir(), retention, &mut warnings))
        .flatten();
    if LOG_SINK.set(file).is_err() {
        return;
    }

    let mut builder = Builder::new();
    builder.is_test(cfg!(test));
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) if file_logging => {
            builder
                .filter_level(LevelFilter::Warn)
                .filter_module("arbor", LevelFilter::Debug)
                .filter_module("pty_host", LevelFilter::Debug)
                .filter_module("portable_pty", LevelFilter::Info);
        }
        Err(_) => {
            builder.filter_level(LevelFilter::Info);
        }
    }

    builder.format(|buf, record| {
        let line = format_line(record);
        writeln!(buf, "{line}")?;
        if let Some(Some(file)) = LOG_SINK.get() {
            file.append(&line);
        }
        Ok(())
    });
    // stdout carries the protocol
    builder.target(env_logger::Target::Stderr);

    if builder.try_init().is_err() {
        return;
    }

    log::info!("arbor v{} (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    match current_log_path() {
        Some(path) => log::info!("Writing logs to {}", path.display()),
        None => log::debug!("File logging disabled"),
    }
    for warning in warnings {
        log::warn!("{warning}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use serial_test::serial;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config_from(pairs: &[(&str, &str)]) -> LoggingConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoggingConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn log_dir_is_namespaced() {
        assert!(get_log_dir().ends_with("arbor/logs"));
        let name = log_file_name();
        assert!(name.starts_with("arbor-") && name.ends_with(".log"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" YES "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn env_toggle_and_retention_are_read() {
        let config = config_from(&[(ENABLE_LOGS_ENV, "1"), (RETENTION_ENV, "2")]);
        assert!(config.file_logging);
        assert_eq!(config.retention, Duration::from_secs(7_200));
        assert!(config.warnings.is_empty());

        assert!(!config_from(&[(ENABLE_LOGS_ENV, "off")]).file_logging);
    }

    #[test]
    fn invalid_values_become_deferred_warnings() {
        let config = config_from(&[(ENABLE_LOGS_ENV, "sometimes"), (RETENTION_ENV, "forever")]);
        assert_eq!(config.file_logging, cfg!(debug_assertions));
        assert_eq!(config.retention, DEFAULT_RETENTION);
        assert_eq!(config.warnings.len(), 2);
        assert!(config.warnings[1].contains(RETENTION_ENV));
    }

    #[test]
    #[serial]
    fn process_environment_is_consulted() {
        let previous = std::env::var(ENABLE_LOGS_ENV).ok();
        std::env::set_var(ENABLE_LOGS_ENV, "false");
        assert!(!LoggingConfig::from_env().file_logging);
        match previous {
            Some(value) => std::env::set_var(ENABLE_LOGS_ENV, value),
            None => std::env::remove_var(ENABLE_LOGS_ENV),
        }
    }

    #[test]
    fn pruning_removes_only_old_log_files() {
        let tmp = TempDir::new().unwrap();
        let old_log = tmp.path().join("arbor-old.log");
        let recent_log = tmp.path().join("arbor-recent.log");
        let unrelated = tmp.path().join("notes.txt");
        for path in [&old_log, &recent_log, &unrelated] {
            std::fs::write(path, "x").unwrap();
        }
        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3_600);
        set_file_mtime(&old_log, FileTime::from_system_time(two_hours_ago)).unwrap();
        set_file_mtime(&unrelated, FileTime::from_system_time(two_hours_ago)).unwrap();

        assert!(prune_logs(tmp.path(), Duration::from_secs(3_600)).is_empty());
        assert!(!old_log.exists());
        assert!(recent_log.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("arbor-x.log");
        std::fs::write(&log, "x").unwrap();
        set_file_mtime(&log, FileTime::from_unix_time(0, 0)).unwrap();

        assert!(prune_logs(tmp.path(), Duration::ZERO).is_empty());
        assert!(log.exists());
    }
}
