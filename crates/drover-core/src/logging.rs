use crate::config::LoggingConfig;
use crate::errors::ConfigError;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Deletes session logs beyond the configured count and age. Filenames are
/// `<prefix><date>_<time>_<pid>.log`, so lexical order is age order.
pub fn rotate_logs(log_dir: &Path, prefix: &str, config: &LoggingConfig) -> Result<(), ConfigError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".log"))
        })
        .collect();

    entries.sort();

    if config.max_files > 0 && entries.len() > config.max_files {
        let to_delete = entries.len() - config.max_files;
        for path in entries.drain(0..to_delete) {
            let _ = fs::remove_file(path);
        }
    }

    if config.max_age_days > 0 {
        let now = SystemTime::now();
        let max_age = Duration::from_secs(config.max_age_days * 24 * 60 * 60);

        for path in entries {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let date_part = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.split('_').next());
            let Some(date_str) = date_part else { continue };
            let Ok(date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                continue;
            };
            let midnight = date.and_hms_opt(0, 0, 0).and_then(|dt| {
                dt.and_local_timezone(chrono::Local).single()
            });
            let Some(log_time) = midnight else { continue };
            if let Ok(age) = now.duration_since(SystemTime::from(log_time)) {
                if age > max_age {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }

    Ok(())
}

fn init_tracing_subscriber(log_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(log_file))
        .with_timer(LocalTimeFormatter)
        .with_ansi(false)
        .with_target(false)
        .with_line_number(true)
        .with_file(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .init();

    tracing::info!("--- Logger Initialized ---");
    Ok(())
}

/// File logger for the long-running manager: one file per session under the
/// XDG cache home, rotated by count and age, with a stable symlink to the
/// latest session.
pub fn init_session_logger(config: &LoggingConfig) -> Result<(), ConfigError> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("drover");
    let cache_home = xdg_dirs
        .get_cache_home()
        .ok_or(ConfigError::CacheDirectoryNotFound)?;
    let logs_dir = cache_home.join("logs");

    rotate_logs(&logs_dir, "drover_", config)?;

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let pid = std::process::id();
    let filename = format!("drover_{}_{}.log", timestamp, pid);
    let log_path = logs_dir.join(&filename);

    init_tracing_subscriber(&log_path)?;

    let symlink_path = cache_home.join("drover.log");
    let _ = fs::remove_file(&symlink_path);
    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let target = Path::new("logs").join(filename);
        let _ = symlink(&target, &symlink_path);
    }

    Ok(())
}

/// Plain stderr logger for one-shot CLI commands.
pub fn init_stderr_logger() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(LocalTimeFormatter)
        .with_ansi(true)
        .with_target(false)
        .with_line_number(false)
        .with_file(false)
        .with_level(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::rotate_logs;
    use crate::config::LoggingConfig;
    use chrono::{Duration as ChronoDuration, Local};
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_rotate_logs_max_files() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let filenames = vec![
            "drover_2024-01-01_10-00-00_1.log",
            "drover_2024-01-02_10-00-00_1.log",
            "drover_2024-01-03_10-00-00_1.log",
            "drover_2024-01-04_10-00-00_1.log",
        ];
        for name in &filenames {
            File::create(path.join(name)).unwrap();
        }
        File::create(path.join("other.txt")).unwrap();

        let config = LoggingConfig {
            max_files: 2,
            max_age_days: 0,
        };
        rotate_logs(path, "drover_", &config).unwrap();

        assert!(!path.join(filenames[0]).exists());
        assert!(!path.join(filenames[1]).exists());
        assert!(path.join(filenames[2]).exists());
        assert!(path.join(filenames[3]).exists());
        assert!(path.join("other.txt").exists(), "non-log files are preserved");
    }

    #[test]
    fn test_rotate_logs_max_age() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let now = Local::now();
        let recent = now - ChronoDuration::days(1);
        let stale = now - ChronoDuration::days(9);
        let fmt = "%Y-%m-%d";

        let name_recent = format!("drover_{}_10-00-00_1.log", recent.format(fmt));
        let name_stale = format!("drover_{}_10-00-00_1.log", stale.format(fmt));
        File::create(path.join(&name_recent)).unwrap();
        File::create(path.join(&name_stale)).unwrap();

        let config = LoggingConfig {
            max_files: 0,
            max_age_days: 7,
        };
        rotate_logs(path, "drover_", &config).unwrap();

        assert!(path.join(&name_recent).exists());
        assert!(!path.join(&name_stale).exists());
    }
}
