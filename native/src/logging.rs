use log::{error, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const LOG_DIR_NAME: &str = "WidgetRenderChannel";
const CRASH_LOG_FILE: &str = "render_worker_crash.log";
const SENTRY_DSN_VAR: &str = "WORKER_SENTRY_DSN";
const SENTRY_ENVIRONMENT_VAR: &str = "SENTRY_ENVIRONMENT";

static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY_GUARD: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);

// The panic hook itself may run while one of these is held.
fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// env_logger at Warn unless `RUST_LOG` says otherwise.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// Start Sentry when a DSN is given. Returns whether reporting is active.
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> bool {
    let dsn = match dsn.map(str::trim) {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("[SENTRY] No DSN configured, error reporting disabled");
            return false;
        }
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: environment.map(|e| e.to_string().into()),
            attach_stacktrace: true,
            send_default_pii: false,
            auto_session_tracking: true,
            session_mode: sentry::SessionMode::Application,
            ..Default::default()
        },
    ));

    if guard.is_enabled() {
        *locked(&SENTRY_GUARD) = Some(guard);
        info!("[SENTRY] Reporting enabled (environment {:?})", environment);
        true
    } else {
        info!("[SENTRY] Client did not start");
        false
    }
}

/// [`init_sentry`] configured from `WORKER_SENTRY_DSN` and `SENTRY_ENVIRONMENT`.
pub fn init_sentry_from_env() -> bool {
    let dsn = std::env::var(SENTRY_DSN_VAR).ok();
    let environment = std::env::var(SENTRY_ENVIRONMENT_VAR).ok();
    init_sentry(dsn.as_deref(), environment.as_deref())
}

pub fn is_sentry_enabled() -> bool {
    locked(&SENTRY_GUARD)
        .as_ref()
        .is_some_and(|g| g.is_enabled())
}

/// End the session and flush queued events.
pub fn shutdown_sentry() {
    if let Some(guard) = locked(&SENTRY_GUARD).take() {
        info!("[SENTRY] Flushing events");
        drop(guard);
    }
}

/// Report an error that keeps the worker from serving commands.
pub fn capture_critical_error(context: &str, error: &str) {
    if !is_sentry_enabled() {
        return;
    }
    sentry::with_scope(
        |scope| {
            scope.set_tag("error_type", "critical");
            scope.set_tag("context", context);
            scope.set_level(Some(sentry::Level::Fatal));
        },
        || {
            sentry::capture_message(
                &format!("[CRITICAL] {}: {}", context, error),
                sentry::Level::Fatal,
            );
        },
    );
}

/// Directory holding the crash log, falling back to the working directory.
pub fn crash_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(LOG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Remember the crash log location and install a panic hook that appends
/// a report to it.
pub fn init_crash_logger() -> PathBuf {
    let log_dir = crash_log_dir();
    if let Err(e) = fs::create_dir_all(&log_dir) {
        error!("[CRASH] Could not create {:?}: {}", log_dir, e);
    }
    let log_path = log_dir.join(CRASH_LOG_FILE);
    *locked(&CRASH_LOG_PATH) = Some(log_path.clone());

    std::panic::set_hook(Box::new(|panic_info| {
        let report = panic_report(panic_info);

        if is_sentry_enabled() {
            sentry::capture_message(&report, sentry::Level::Fatal);
        }
        if let Err(e) = write_crash_log(&report) {
            error!("[CRASH] Failed to write crash log: {}", e);
        }
        error!("{}", report);
    }));

    info!("[CRASH] Crash log at {:?}", log_path);
    log_path
}

fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

fn panic_report(panic_info: &std::panic::PanicHookInfo) -> String {
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());

    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown location".to_string());

    format!(
        "\n===== RENDER WORKER PANIC =====\nTimestamp: {}\nLocation: {}\nMessage: {}\nThread: {}\n\nBacktrace:\n{}\n",
        timestamp(),
        location,
        payload,
        thread_name(),
        std::backtrace::Backtrace::capture()
    )
}

fn critical_report(context: &str, error: &str) -> String {
    format!(
        "\n===== CRITICAL ERROR =====\nTimestamp: {}\nContext: {}\nError: {}\nThread: {}\n",
        timestamp(),
        context,
        error,
        thread_name()
    )
}

fn append_report(path: &Path, report: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", report)
}

fn write_crash_log(report: &str) -> std::io::Result<()> {
    match locked(&CRASH_LOG_PATH).as_deref() {
        Some(path) => append_report(path, report),
        None => Ok(()),
    }
}

/// Record a non-panicking failure in the crash log and with Sentry.
pub fn log_critical_error(context: &str, error: &str) {
    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Error));
            },
            || {
                sentry::capture_message(error, sentry::Level::Error);
            },
        );
    }

    let report = critical_report(context, error);
    if let Err(e) = write_crash_log(&report) {
        error!("[CRASH] Failed to write critical error: {}", e);
    }
    error!("{}", report);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dsn_leaves_sentry_disabled() {
        assert!(!init_sentry(None, None));
        assert!(!init_sentry(Some("   "), Some("test")));
        assert!(!is_sentry_enabled());
    }

    #[test]
    fn critical_report_names_context_and_error() {
        let report = critical_report("initialize", "no transport");
        assert!(report.contains("CRITICAL ERROR"));
        assert!(report.contains("Context: initialize"));
        assert!(report.contains("Error: no transport"));
    }

    #[test]
    fn reports_are_appended() {
        let path = std::env::temp_dir().join(format!("crash-{}.log", uuid::Uuid::new_v4()));
        append_report(&path, "first").unwrap();
        append_report(&path, "second").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.find("first").unwrap() < contents.find("second").unwrap());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn crash_log_lives_under_channel_directory() {
        assert!(crash_log_dir().ends_with(LOG_DIR_NAME) || crash_log_dir() == Path::new("."));
    }
}
