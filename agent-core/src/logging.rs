//! Structured local logging: rotates to a fresh timestamped file per run inside `log_dir`
//! and prunes all but the most recent file, matching this codebase's existing local-server
//! logging setup.

use std::fs;
use std::path::Path;

use chrono::Local;

/// Initializes `log`/`fern` to write to stdout and to a timestamped file under `log_dir`,
/// then deletes every other file already in `log_dir`.
///
/// `log_level` is one of "trace" | "debug" | "info" | "warn" | "error"; unrecognized values
/// fall back to "info".
pub fn setup_logging(log_dir: &Path, log_level: &str) -> anyhow::Result<()> {
    fs::create_dir_all(log_dir)?;

    let level = parse_level(log_level);
    let file_name = format!("agent-{}.log", Local::now().format("%Y%m%d-%H%M%S"));
    let file_path = log_dir.join(&file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(&file_path)?)
        .apply()?;

    cleanup_old_logs(log_dir, &file_name)?;
    Ok(())
}

fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Removes every file in `log_dir` except `keep`, logging (rather than failing) on
/// individual delete errors so a single locked file doesn't block startup.
fn cleanup_old_logs(log_dir: &Path, keep: &str) -> anyhow::Result<()> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(keep) {
            continue;
        }
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("failed to prune old log file {}: {e}", path.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(parse_level("bogus"), log::LevelFilter::Info);
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
    }

    #[test]
    fn cleanup_keeps_only_named_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("agent-old1.log"), b"old").unwrap();
        fs::write(dir.path().join("agent-old2.log"), b"old").unwrap();
        fs::write(dir.path().join("agent-new.log"), b"new").unwrap();

        cleanup_old_logs(dir.path(), "agent-new.log").unwrap();

        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["agent-new.log".to_string()]);
    }
}
