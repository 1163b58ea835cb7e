// ───── Std Lib ─────
use std::path::PathBuf;

// ───── Crates ─────
use fern;
use log;
use once_cell::sync::OnceCell;
use sys_info;

// ───── Local Modules ─────
use crate::config::get_config_path;

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Sets up logging for the service.
///
/// This function configures the logging system using the `fern` crate:
/// console output always, plus a `log.txt` next to the configuration file
/// when that directory is writable. Calling it more than once is a no-op.
pub fn setup_logging() {
    if LOGGING_INITIALIZED.set(()).is_err() {
        log::debug!("Logging already initialized");
        return;
    }

    let log_file: Option<PathBuf> = match get_config_path() {
        Ok(mut path) => {
            path.set_file_name("log.txt");
            Some(path)
        }
        Err(e) => {
            eprintln!("Failed to resolve log directory: {}", e);
            None
        }
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info) // Change to Debug if needed
        .chain(std::io::stdout());

    if let Some(path) = &log_file {
        match fern::log_file(path) {
            // Check if the log file can be created. Permission check.
            Ok(file) => {
                dispatch = dispatch.chain(file);
            }
            Err(e) => {
                eprintln!("Failed to create log file: {}", e);
            }
        }
    }

    if let Err(e) = dispatch.apply() {
        log::warn!("Failed to initialize logging: {}", e);
        return;
    }

    // Log the service launch
    log::info!("-== Card terminal service is launched ==-");

    // Log system information
    log_system_info();
}

/// Formats a `sys_info` probe result, falling back to "Unknown" when the
/// platform does not expose the value.
fn probe_or_unknown<T: std::fmt::Display>(probe: Result<T, sys_info::Error>) -> String {
    probe.map_or_else(|_| "Unknown".to_string(), |value| value.to_string())
}

fn log_system_info() {
    let cpu = match (sys_info::cpu_num(), sys_info::cpu_speed()) {
        (Ok(count), Ok(speed)) => format!("{} x {} MHz", count, speed),
        (Ok(count), Err(_)) => count.to_string(),
        _ => "Unknown".to_string(),
    };
    let memory = sys_info::mem_info().map_or_else(
        |_| "Unknown".to_string(),
        |mem| format!("{} KB total, {} KB free", mem.total, mem.free),
    );

    log::info!(
        "System: {} {} on '{}', CPU: {}, Memory: {}",
        probe_or_unknown(sys_info::os_type()),
        probe_or_unknown(sys_info::os_release()),
        probe_or_unknown(sys_info::hostname()),
        cpu,
        memory
    );
}
