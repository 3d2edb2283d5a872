use serde::{Deserialize, Serialize};

/// Kernel crash taxonomy recognized in console logs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CrashType {
    Kasan,
    Ubsan,
    GeneralProtectionFault,
    NullPointerDereference,
    StackOverflow,
    MemoryCorruption,
    Deadlock,
    KernelBug,
    Warning,
}

impl CrashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashType::Kasan => "kasan",
            CrashType::Ubsan => "ubsan",
            CrashType::GeneralProtectionFault => "general_protection_fault",
            CrashType::NullPointerDereference => "null_pointer_dereference",
            CrashType::StackOverflow => "stack_overflow",
            CrashType::MemoryCorruption => "memory_corruption",
            CrashType::Deadlock => "deadlock",
            CrashType::KernelBug => "kernel_bug",
            CrashType::Warning => "warning",
        }
    }

    /// Severity from [`SEVERITY_TABLE`]; types without a row are `Low`.
    pub fn severity(&self) -> Severity {
        SEVERITY_TABLE
            .iter()
            .find(|(crash_type, _)| crash_type == self)
            .map(|(_, severity)| *severity)
            .unwrap_or(Severity::Low)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

pub const SEVERITY_TABLE: &[(CrashType, Severity)] = &[
    (CrashType::Kasan, Severity::Critical),
    (CrashType::GeneralProtectionFault, Severity::Critical),
    (CrashType::StackOverflow, Severity::Critical),
    (CrashType::KernelBug, Severity::High),
    (CrashType::NullPointerDereference, Severity::High),
    (CrashType::MemoryCorruption, Severity::High),
    (CrashType::Deadlock, Severity::Medium),
];

/// Ordered signature table. Detection returns the first row with a matching
/// pattern, so more specific signatures must precede generic ones such as
/// `"bug:"`. Patterns are lowercase and matched against the lowercased log.
pub const CRASH_SIGNATURES: &[(CrashType, &[&str])] = &[
    (CrashType::Kasan, &["bug: kasan", "kasan:"]),
    (CrashType::Ubsan, &["ubsan:"]),
    (CrashType::GeneralProtectionFault, &["general protection fault"]),
    (
        CrashType::NullPointerDereference,
        &[
            "null pointer dereference",
            "unable to handle kernel null pointer",
        ],
    ),
    (
        CrashType::StackOverflow,
        &[
            "stack-protector",
            "stack overflow",
            "stack guard page",
            "corrupted stack end",
        ],
    ),
    (
        CrashType::MemoryCorruption,
        &[
            "memory corruption",
            "double free",
            "use-after-free",
            "bad page state",
            "slab corruption",
        ],
    ),
    (
        CrashType::Deadlock,
        &[
            "possible deadlock",
            "possible circular locking dependency",
            "deadlock",
            "task hung",
            "blocked for more than",
        ],
    ),
    (
        CrashType::KernelBug,
        &["kernel bug at", "bug:", "oops:", "kernel panic"],
    ),
    (CrashType::Warning, &["warning:"]),
];

const STACK_TRACE_MARKERS: &[&str] = &["Call Trace:", "Backtrace:", "Stack:"];

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashDetection {
    pub crash_type: CrashType,
    pub matched_pattern: &'static str,
    pub severity: Severity,
}

/// Classifies raw kernel console output against [`CRASH_SIGNATURES`].
#[derive(Debug, Clone)]
pub struct CrashClassifier {
    signatures: &'static [(CrashType, &'static [&'static str])],
}

impl Default for CrashClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashClassifier {
    pub fn new() -> Self {
        Self {
            signatures: CRASH_SIGNATURES,
        }
    }

    pub fn detect(&self, log_text: &str) -> Option<CrashDetection> {
        let haystack = log_text.to_lowercase();
        for (crash_type, patterns) in self.signatures {
            if let Some(pattern) = patterns.iter().find(|p| haystack.contains(*p)) {
                return Some(CrashDetection {
                    crash_type: *crash_type,
                    matched_pattern: *pattern,
                    severity: crash_type.severity(),
                });
            }
        }
        None
    }

    /// Captures from the first marker line through the indented (or blank)
    /// lines that follow it.
    pub fn extract_stack_trace(&self, log_text: &str) -> Option<String> {
        let mut captured: Vec<&str> = Vec::new();
        let mut capturing = false;

        for line in log_text.lines() {
            if !capturing {
                if STACK_TRACE_MARKERS.iter().any(|m| line.contains(m)) {
                    capturing = true;
                    captured.push(line);
                }
                continue;
            }
            let continues = line.trim().is_empty()
                || line.starts_with('[')
                || line.starts_with(' ')
                || line.starts_with('\t');
            if !continues {
                break;
            }
            captured.push(line);
        }

        if capturing {
            Some(captured.join("\n"))
        } else {
            None
        }
    }

    /// First frame of the form `[<addr>] func+0x1a/0x40` (or with a
    /// timestamp prefix), scanning top to bottom.
    pub fn extract_affected_function(&self, stack_trace: &str) -> Option<String> {
        stack_trace
            .lines()
            .filter(|line| line.contains("+0x") && line.contains(']'))
            .find_map(|line| {
                let (_, rest) = line.split_once(']')?;
                let (function, _) = rest.split_once("+0x")?;
                Some(function.trim().to_string())
            })
    }

    /// The first line mentioning `matched_pattern`, without its leading
    /// `[ timestamp]` prefix.
    pub fn extract_title(&self, log_text: &str, matched_pattern: &str) -> Option<String> {
        let needle = matched_pattern.to_lowercase();
        log_text
            .lines()
            .find(|line| line.to_lowercase().contains(&needle))
            .map(|line| strip_timestamp(line).trim().to_string())
            .filter(|title| !title.is_empty())
    }
}

fn strip_timestamp(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest;
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    const KASAN_LOG: &str = "\
[   42.100000] ==================================================================
[   42.100001] BUG: KASAN: use-after-free in ext4_xattr_set_entry+0x1a/0x40
[   42.100002] Read of size 8 at addr ffff888012345678 by task syz-executor/1234
[   42.100003] Call Trace:
[   42.100004]  dump_stack+0x10/0x20
[   42.100005]  ext4_xattr_set_entry+0x1a/0x40

[   42.100006]  do_syscall_64+0x33/0x40
Disabling lock debugging due to kernel taint
[   42.100007] Call Trace:
";

    #[test]
    fn detects_general_protection_fault_as_critical() {
        let classifier = CrashClassifier::new();
        let detection = classifier
            .detect("general protection fault: 0000 [#1] SMP")
            .expect("gpf should be detected");
        assert_eq!(detection.crash_type, CrashType::GeneralProtectionFault);
        assert_eq!(detection.crash_type.as_str(), "general_protection_fault");
        assert_eq!(detection.severity, Severity::Critical);
    }

    #[test]
    fn detects_warning_as_low() {
        let classifier = CrashClassifier::new();
        let detection = classifier
            .detect("WARNING: CPU: 0 PID: 1234 at kernel/foo.c:42")
            .expect("warning should be detected");
        assert_eq!(detection.crash_type, CrashType::Warning);
        assert_eq!(detection.severity, Severity::Low);
    }

    #[test]
    fn first_matching_signature_wins() {
        let classifier = CrashClassifier::new();
        // Matches kasan, memory_corruption ("use-after-free") and kernel_bug ("bug:").
        let detection = classifier.detect(KASAN_LOG).expect("kasan should be detected");
        assert_eq!(detection.crash_type, CrashType::Kasan);
        assert_eq!(detection.matched_pattern, "bug: kasan");
        assert_eq!(detection.severity, Severity::Critical);

        let npd = classifier
            .detect("BUG: kernel NULL pointer dereference, address: 0000000000000008")
            .expect("null deref should be detected");
        assert_eq!(npd.crash_type, CrashType::NullPointerDereference);
        assert_eq!(npd.severity, Severity::High);
    }

    #[test]
    fn detection_is_case_insensitive() {
        let classifier = CrashClassifier::new();
        let detection = classifier
            .detect("WARNING: POSSIBLE DEADLOCK DETECTED")
            .expect("deadlock should be detected");
        assert_eq!(detection.crash_type, CrashType::Deadlock);
        assert_eq!(detection.severity, Severity::Medium);
    }

    #[test]
    fn clean_log_is_not_a_crash() {
        let classifier = CrashClassifier::new();
        assert!(classifier.detect("systemd[1]: Started Journal Service.").is_none());
        assert!(classifier.detect("").is_none());
    }

    #[test]
    fn severity_table_covers_documented_types() {
        assert_eq!(CrashType::Kasan.severity(), Severity::Critical);
        assert_eq!(CrashType::StackOverflow.severity(), Severity::Critical);
        assert_eq!(CrashType::KernelBug.severity(), Severity::High);
        assert_eq!(CrashType::MemoryCorruption.severity(), Severity::High);
        assert_eq!(CrashType::Deadlock.severity(), Severity::Medium);
        assert_eq!(CrashType::Ubsan.severity(), Severity::Low);
        assert_eq!(CrashType::Warning.severity(), Severity::Low);
    }

    #[test]
    fn stack_trace_capture_spans_blank_lines_and_stops_at_unindented_line() {
        let classifier = CrashClassifier::new();
        let trace = classifier
            .extract_stack_trace(KASAN_LOG)
            .expect("trace should be found");
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines.first().copied(), Some("[   42.100003] Call Trace:"));
        assert_eq!(lines.len(), 5, "marker, two frames, blank, frame: {trace:?}");
        assert!(!trace.contains("Disabling lock debugging"));
        assert!(
            !trace.ends_with("Call Trace:"),
            "only the first marker starts capture"
        );
    }

    #[test]
    fn stack_trace_absent_without_marker() {
        let classifier = CrashClassifier::new();
        assert!(classifier.extract_stack_trace("kernel BUG at mm/slub.c:42").is_none());
    }

    #[test]
    fn stack_trace_accepts_tab_and_space_continuations() {
        let classifier = CrashClassifier::new();
        let log = "Backtrace:\n\tframe_a+0x1/0x2\n frame_b+0x3/0x4\nend";
        assert_eq!(
            classifier.extract_stack_trace(log).as_deref(),
            Some("Backtrace:\n\tframe_a+0x1/0x2\n frame_b+0x3/0x4")
        );
    }

    #[test]
    fn stack_marker_starts_capture() {
        let classifier = CrashClassifier::new();
        let log = "Oops: 0002 [#1] SMP\nStack:\n ffff8800 00000000\n [<c0101234>] sys_read+0x12/0x30\nCode: 89 50 04";
        assert_eq!(
            classifier.extract_stack_trace(log).as_deref(),
            Some("Stack:\n ffff8800 00000000\n [<c0101234>] sys_read+0x12/0x30")
        );
    }

    #[test]
    fn blank_line_right_after_marker_is_kept() {
        let classifier = CrashClassifier::new();
        let log = "Call Trace:\n\n [<ffffffff81>] tcp_v4_rcv+0x44/0x90\nRIP: 0010";
        let trace = classifier.extract_stack_trace(log).expect("trace should be found");
        assert_eq!(trace, "Call Trace:\n\n [<ffffffff81>] tcp_v4_rcv+0x44/0x90");
        assert_eq!(
            classifier.extract_affected_function(&trace).as_deref(),
            Some("tcp_v4_rcv")
        );
    }

    #[test]
    fn affected_function_is_first_qualifying_frame() {
        let classifier = CrashClassifier::new();
        let trace = "Call Trace:\n [<ffffffff81000000>] ext4_fill_super+0x2a/0x100\n [<ffffffff81000100>] mount_bdev+0x10/0x20";
        assert_eq!(
            classifier.extract_affected_function(trace).as_deref(),
            Some("ext4_fill_super")
        );
    }

    #[test]
    fn affected_function_skips_lines_without_offsets() {
        let classifier = CrashClassifier::new();
        let trace = "Call Trace:\n[   1.0] <TASK>\n[   1.1]  kmem_cache_free+0x5/0x9";
        assert_eq!(
            classifier.extract_affected_function(trace).as_deref(),
            Some("kmem_cache_free")
        );
        assert!(classifier.extract_affected_function("no frames here").is_none());
        assert!(
            classifier
                .extract_affected_function("func+0x10/0x20 without bracket")
                .is_none()
        );
    }

    #[test]
    fn title_strips_timestamp_prefix() {
        let classifier = CrashClassifier::new();
        let detection = classifier.detect(KASAN_LOG).expect("kasan should be detected");
        assert_eq!(
            classifier.extract_title(KASAN_LOG, detection.matched_pattern).as_deref(),
            Some("BUG: KASAN: use-after-free in ext4_xattr_set_entry+0x1a/0x40")
        );
    }
}
