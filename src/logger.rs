use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

/// Append-only transition log shared by every `taskq` process pointed at the
/// same queue. Each line is `<utc-ts> pid=<pid> <event> key=value...`.
#[derive(Debug)]
pub(crate) struct Logger {
    path: Option<PathBuf>,
    disabled: AtomicBool,
}

impl Logger {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            disabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::new(None)
    }

    pub(crate) fn log_event(&self, event: &str, fields: &[(&str, &dyn std::fmt::Display)]) {
        if self.path.is_none() {
            return;
        }
        let mut message = event.to_string();
        for (key, value) in fields {
            message.push(' ');
            message.push_str(key);
            message.push('=');
            message.push_str(&value.to_string());
        }
        self.log_transition(&message);
    }

    pub(crate) fn log_transition(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let sanitized = sanitize_log_value(message);
        let line = format!("{} pid={} {}\n", ts, process::id(), sanitized);
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                self.disable_with_warning(path, &err);
                return;
            }
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            self.disable_with_warning(path, &err);
        }
    }

    fn disable_with_warning(&self, path: &Path, err: &std::io::Error) {
        // Warn once, then stop retrying; queue operations must not fail on logging.
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(
                stderr,
                "Warning: transition logging disabled log_path={} io_error={}",
                path.display(),
                err
            );
        }
    }
}

pub(crate) fn sanitize_log_value(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_log_value_replaces_controls() {
        assert_eq!(
            sanitize_log_value("line\ncarriage\rtab\t"),
            "line\\ncarriage\\rtab\\t"
        );
    }

    #[test]
    fn log_event_formats_key_value_fields() {
        let temp = TempDir::new().expect("temp dir");
        let log_path = temp.path().join("taskq.log");
        let logger = Logger::new(Some(log_path.clone()));

        logger.log_event("create", &[("task", &"custom-1"), ("priority", &5)]);
        logger.log_event("remove", &[("task", &"multi\nline")]);

        let contents = fs::read_to_string(&log_path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let pid_field = format!("pid={}", process::id());
        assert!(lines[0].contains(&pid_field), "missing pid in {:?}", lines[0]);
        assert!(lines[0].ends_with("create task=custom-1 priority=5"));
        assert!(lines[1].ends_with("remove task=multi\\nline"));
    }

    #[test]
    fn logging_disables_itself_after_io_error() {
        let temp = TempDir::new().expect("temp dir");
        let log_dir = temp.path().join("missing-log-dir");
        let log_path = log_dir.join("taskq.log");
        let logger = Logger::new(Some(log_path.clone()));

        logger.log_transition("first");
        fs::create_dir(&log_dir).expect("create log dir");
        logger.log_transition("second");

        assert!(
            !log_path.exists(),
            "logging should stay disabled after the first error"
        );
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = Logger::disabled();
        logger.log_event("noop", &[("k", &"v")]);
    }
}
