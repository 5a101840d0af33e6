//! Deny-pattern guard applied before any shell or file execution.
//!
//! A match returns a `blocked` result without executing anything. The list
//! targets destructive filesystem operations, privilege escalation, fork
//! bombs, piped-download-to-shell, and writes under sensitive system paths.

use regex::Regex;

use armada_protocol::FileAction;

/// (pattern, reason) pairs compiled at agent startup.
const DENY_PATTERNS: &[(&str, &str)] = &[
    (
        r"rm\s+(-\S+\s+)+(/|/\*)\s*$",
        "recursive delete of the filesystem root",
    ),
    (
        r"rm\s+(-\S+\s+)+/(etc|boot|bin|sbin|usr|lib)(/\S*)?\s*$",
        "recursive delete under a system directory",
    ),
    (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem format"),
    (r"\bdd\b[^|]*\bof=/dev/", "raw write to a block device"),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
    (
        r"(curl|wget)\b[^|;]*\|\s*(sudo\s+)?(sh|bash|zsh)\b",
        "piped download to shell",
    ),
    (r"(^|;|&&|\|\|)\s*sudo\b", "privilege escalation"),
    (r"\bsu\s+(-\s*|root\b)", "privilege escalation"),
    (r">\s*/(etc|boot|sys|proc)/", "shell redirect into a system path"),
    (r"\bchmod\s+(-[A-Za-z]+\s+)*[0-7]*777\s+/\s*$", "world-writable root"),
];

/// Write targets the agent refuses to touch.
const SENSITIVE_WRITE_PREFIXES: &[&str] = &["/etc/", "/boot/", "/sys/", "/proc/", "/dev/", "/usr/bin/", "/usr/sbin/"];

/// Read targets that hold credentials.
const SENSITIVE_READ_PATHS: &[&str] = &["/etc/shadow", "/etc/sudoers", "/etc/gshadow"];

pub struct CommandGuard {
    patterns: Vec<(Regex, &'static str)>,
}

impl CommandGuard {
    pub fn new() -> Result<Self, regex::Error> {
        let mut patterns = Vec::with_capacity(DENY_PATTERNS.len());
        for (pattern, reason) in DENY_PATTERNS {
            patterns.push((Regex::new(pattern)?, *reason));
        }
        Ok(Self { patterns })
    }

    /// Returns the deny reason when the command text matches a pattern.
    pub fn check_shell(&self, command: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(command))
            .map(|(_, reason)| *reason)
    }

    /// Returns the deny reason for a file operation on `path`.
    pub fn check_file(&self, action: FileAction, path: &str) -> Option<&'static str> {
        match action {
            FileAction::Write => SENSITIVE_WRITE_PREFIXES
                .iter()
                .any(|prefix| path.starts_with(prefix))
                .then_some("write under a sensitive system path"),
            FileAction::Read => SENSITIVE_READ_PATHS
                .iter()
                .any(|sensitive| path == *sensitive)
                .then_some("read of a credential file"),
        }
    }
}
