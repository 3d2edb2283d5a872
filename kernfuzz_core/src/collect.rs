use crate::campaign::CrashInfo;
use crate::classifier::CrashClassifier;
use chrono::Utc;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const CRASHES_DIR: &str = "crashes";
pub const CRASH_LOG_FILE: &str = "log";
pub const CRASH_DESCRIPTION_FILE: &str = "description";
pub const REPRODUCER_FILE: &str = "repro.prog";
pub const STATS_FILE: &str = "stats.json";

/// Keeps stored log excerpts bounded; full logs stay in the work dir.
const MAX_LOG_EXCERPT_BYTES: usize = 8 * 1024;

/// Aggregate execution statistics written by the engine.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    #[serde(default)]
    pub exec_total: u64,
    #[serde(default)]
    pub coverage: f64,
}

/// Reads `work_dir/stats.json`. A missing or unparsable artifact yields zeros.
pub fn read_stats(work_dir: &Path) -> EngineStats {
    let path = work_dir.join(STATS_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            debug!(?path, error = %e, "no engine statistics");
            return EngineStats::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(stats) => stats,
        Err(e) => {
            warn!(?path, error = %e, "unparsable engine statistics, using zeros");
            EngineStats::default()
        }
    }
}

/// Turns every classifiable crash record under `work_dir/crashes` into a
/// [`CrashInfo`], in directory-listing order. Records without a readable log
/// or without a known crash signature are skipped.
pub fn collect_crashes(work_dir: &Path, classifier: &CrashClassifier) -> Vec<CrashInfo> {
    let crashes_dir = work_dir.join(CRASHES_DIR);
    let entries = match fs::read_dir(&crashes_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(?crashes_dir, error = %e, "no crash directory");
            return Vec::new();
        }
    };

    let mut crashes = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(?crashes_dir, error = %e, "failed to read crash directory entry");
                continue;
            }
        };
        let crash_dir = entry.path();
        if !crash_dir.is_dir() {
            continue;
        }
        if let Some(crash) = parse_crash_dir(&crash_dir, classifier) {
            crashes.push(crash);
        }
    }
    crashes
}

fn parse_crash_dir(crash_dir: &Path, classifier: &CrashClassifier) -> Option<CrashInfo> {
    let log_path = crash_dir.join(CRASH_LOG_FILE);
    let log_text = match fs::read(&log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(?crash_dir, error = %e, "crash record has no readable log, omitted");
            return None;
        }
    };

    let Some(detection) = classifier.detect(&log_text) else {
        debug!(?crash_dir, "crash record matches no known signature, omitted");
        return None;
    };

    let crash_id = crash_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let title = read_first_line(&crash_dir.join(CRASH_DESCRIPTION_FILE))
        .or_else(|| classifier.extract_title(&log_text, detection.matched_pattern))
        .unwrap_or_else(|| detection.crash_type.as_str().to_string());

    let stack_trace = classifier.extract_stack_trace(&log_text);
    let affected_function = stack_trace
        .as_deref()
        .and_then(|trace| classifier.extract_affected_function(trace));

    let reproducer = fs::read(crash_dir.join(REPRODUCER_FILE))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    let reproducer_hash = reproducer.as_deref().map(CrashInfo::reproducer_digest);

    Some(CrashInfo {
        crash_id,
        title,
        crash_type: detection.crash_type,
        severity: detection.severity,
        reproducer,
        reproducer_hash,
        minimized_reproducer: None,
        raw_log_excerpt: excerpt(&log_text),
        stack_trace,
        affected_function,
        discovered_at: Utc::now(),
    })
}

fn read_first_line(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn excerpt(log_text: &str) -> String {
    if log_text.len() <= MAX_LOG_EXCERPT_BYTES {
        return log_text.to_string();
    }
    let mut end = MAX_LOG_EXCERPT_BYTES;
    while !log_text.is_char_boundary(end) {
        end -= 1;
    }
    log_text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{CrashType, Severity};
    use std::path::PathBuf;

    fn write_record(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(CRASHES_DIR).join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, body) in files {
            fs::write(dir.join(file), body).unwrap();
        }
        dir
    }

    #[test]
    fn missing_crash_directory_yields_nothing() {
        let work = tempfile::tempdir().unwrap();
        assert!(collect_crashes(work.path(), &CrashClassifier::new()).is_empty());
    }

    #[test]
    fn builds_crash_info_from_log_and_reproducer() {
        let work = tempfile::tempdir().unwrap();
        write_record(
            work.path(),
            "abc123",
            &[
                (
                    CRASH_LOG_FILE,
                    "[ 5.0] general protection fault: 0000 [#1] SMP\n[ 5.1] Call Trace:\n [<ffffffff81>] tcp_v4_rcv+0x44/0x90\n",
                ),
                (REPRODUCER_FILE, "socket(0x2, 0x1, 0x0)\n"),
            ],
        );

        let crashes = collect_crashes(work.path(), &CrashClassifier::new());
        assert_eq!(crashes.len(), 1);
        let crash = &crashes[0];
        assert_eq!(crash.crash_id, "abc123");
        assert_eq!(crash.crash_type, CrashType::GeneralProtectionFault);
        assert_eq!(crash.severity, Severity::Critical);
        assert_eq!(crash.title, "general protection fault: 0000 [#1] SMP");
        assert_eq!(crash.affected_function.as_deref(), Some("tcp_v4_rcv"));
        assert_eq!(crash.reproducer.as_deref(), Some("socket(0x2, 0x1, 0x0)\n"));
        assert_eq!(
            crash.reproducer_hash,
            Some(CrashInfo::reproducer_digest("socket(0x2, 0x1, 0x0)\n"))
        );
        assert!(crash.minimized_reproducer.is_none());
    }

    #[test]
    fn description_file_overrides_title() {
        let work = tempfile::tempdir().unwrap();
        write_record(
            work.path(),
            "d1",
            &[
                (CRASH_LOG_FILE, "WARNING: CPU: 1 PID: 7 at mm/page_alloc.c:1\n"),
                (CRASH_DESCRIPTION_FILE, "\nWARNING in __alloc_pages\n"),
            ],
        );
        let crashes = collect_crashes(work.path(), &CrashClassifier::new());
        assert_eq!(crashes[0].title, "WARNING in __alloc_pages");
        assert!(crashes[0].reproducer.is_none());
        assert!(crashes[0].stack_trace.is_none());
    }

    #[test]
    fn unreadable_and_unmatched_records_are_omitted() {
        let work = tempfile::tempdir().unwrap();
        write_record(work.path(), "nolog", &[(REPRODUCER_FILE, "x")]);
        write_record(work.path(), "clean", &[(CRASH_LOG_FILE, "all good\n")]);
        write_record(work.path(), "bug", &[(CRASH_LOG_FILE, "kernel BUG at mm/slub.c:42!\n")]);
        fs::write(work.path().join(CRASHES_DIR).join("stray-file"), "ignored").unwrap();

        let crashes = collect_crashes(work.path(), &CrashClassifier::new());
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].crash_id, "bug");
        assert_eq!(crashes[0].crash_type, CrashType::KernelBug);
    }

    #[test]
    fn long_logs_are_truncated_in_excerpt() {
        let log = format!("KASAN: slab-out-of-bounds\n{}", "é".repeat(MAX_LOG_EXCERPT_BYTES));
        let cut = excerpt(&log);
        assert!(cut.len() <= MAX_LOG_EXCERPT_BYTES);
        assert!(log.starts_with(&cut));
    }

    #[test]
    fn stats_default_to_zero_when_missing_or_garbled() {
        let work = tempfile::tempdir().unwrap();
        assert_eq!(read_stats(work.path()), EngineStats::default());

        fs::write(work.path().join(STATS_FILE), "{not json").unwrap();
        assert_eq!(read_stats(work.path()), EngineStats::default());

        fs::write(work.path().join(STATS_FILE), r#"{"exec_total": 99, "coverage": 12.5}"#)
            .unwrap();
        let stats = read_stats(work.path());
        assert_eq!(stats.exec_total, 99);
        assert_eq!(stats.coverage, 12.5);
    }
}
