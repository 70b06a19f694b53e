//! Default-deny command policy.
//!
//! A command runs only when every gate passes, checked in this order:
//! CLI tools enabled, command parses, program allow-listed, not a package
//! install (unless allowed), no deny pattern matches.

use std::path::Path;
use std::sync::OnceLock;

use pipewright_common::CommandPolicy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow { argv: Vec<String> },
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

const PACKAGE_INSTALL_PATTERNS: &[&str] = &[
    r"\bpip3?\s+install\b",
    r"\buv\s+(pip\s+install|add)\b",
    r"\bpoetry\s+add\b",
    r"\bnpm\s+(install|i|add|ci)\b",
    r"\byarn\s+add\b",
    r"\bpnpm\s+(add|install|i)\b",
    r"\bcargo\s+(install|add)\b",
    r"\bgo\s+(get|install)\b",
    r"\bgem\s+install\b",
    r"\bbrew\s+install\b",
    r"\bapt(-get)?\s+install\b",
];

fn package_install_regexes() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PACKAGE_INSTALL_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

pub fn is_package_install(command: &str) -> bool {
    package_install_regexes().iter().any(|re| re.is_match(command))
}

pub fn apply_policy(command: &str, policy: &CommandPolicy) -> PolicyDecision {
    let command = command.trim();
    if command.is_empty() {
        return PolicyDecision::deny("empty command");
    }
    if !policy.allow_cli_tools {
        return PolicyDecision::deny("CLI tools are disabled (sandbox.allow_cli_tools = false)");
    }

    let argv = match split_command(command) {
        Ok(argv) if !argv.is_empty() => argv,
        Ok(_) => return PolicyDecision::deny("empty command"),
        Err(e) => return PolicyDecision::deny(format!("unparseable command: {}", e)),
    };

    let program = Path::new(&argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !policy.allow.iter().any(|allowed| allowed == &program) {
        return PolicyDecision::deny(format!("program '{}' is not on the allow-list", program));
    }

    if !policy.allow_package_install && is_package_install(command) {
        return PolicyDecision::deny(
            "package installation is disabled (sandbox.allow_package_install = false)",
        );
    }

    for pattern in &policy.deny_patterns {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(command) => {
                return PolicyDecision::deny(format!("matches deny pattern '{}'", pattern));
            }
            Ok(_) => {}
            Err(_) => {
                return PolicyDecision::deny(format!("invalid deny pattern '{}'", pattern));
            }
        }
    }

    PolicyDecision::Allow { argv }
}

/// Split a command line into argv with POSIX-ish quoting rules.
/// No expansion, globbing or operators: the result is executed directly.
pub fn split_command(command: &str) -> Result<Vec<String>, String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        argv.push(current);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_policy() -> CommandPolicy {
        CommandPolicy {
            allow_cli_tools: true,
            ..CommandPolicy::default()
        }
    }

    #[test]
    fn test_denied_when_cli_tools_disabled() {
        let decision = apply_policy("pytest -q", &CommandPolicy::default());
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_allow_listed_program() {
        let decision = apply_policy("pytest -q tests/", &open_policy());
        assert_eq!(
            decision,
            PolicyDecision::Allow {
                argv: vec!["pytest".into(), "-q".into(), "tests/".into()]
            }
        );
        // Absolute program paths are matched by basename.
        assert!(apply_policy("/usr/bin/python3 -V", &open_policy()).is_allowed());
    }

    #[test]
    fn test_unlisted_program_denied() {
        match apply_policy("bash -c 'ls'", &open_policy()) {
            PolicyDecision::Deny { reason } => assert!(reason.contains("bash")),
            other => panic!("Expected Deny, got {other:?}"),
        }
    }

    #[test]
    fn test_package_install_gated() {
        let policy = open_policy();
        assert!(!apply_policy("python3 -m pip install requests", &policy).is_allowed());
        assert!(!apply_policy("cargo install ripgrep", &policy).is_allowed());

        let permissive = CommandPolicy {
            allow_package_install: true,
            ..open_policy()
        };
        assert!(apply_policy("cargo install ripgrep", &permissive).is_allowed());
    }

    #[test]
    fn test_deny_patterns() {
        let policy = CommandPolicy {
            deny_patterns: vec![r"--force\b".into()],
            ..open_policy()
        };
        assert!(!apply_policy("make clean --force", &policy).is_allowed());
        assert!(apply_policy("make test", &policy).is_allowed());
    }

    #[test]
    fn test_invalid_deny_pattern_fails_closed() {
        let policy = CommandPolicy {
            deny_patterns: vec!["(unclosed".into()],
            ..open_policy()
        };
        assert!(!apply_policy("make test", &policy).is_allowed());
    }

    #[test]
    fn test_split_command_quoting() {
        assert_eq!(
            split_command(r#"python3 -c "print('a b')" 'x y' z\ w"#).unwrap(),
            vec!["python3", "-c", "print('a b')", "x y", "z w"]
        );
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
        assert!(split_command("echo 'open").is_err());
    }

    #[test]
    fn test_is_package_install() {
        assert!(is_package_install("npm install express"));
        assert!(is_package_install("pip3 install -r requirements.txt"));
        assert!(!is_package_install("npm test"));
        assert!(!is_package_install("pytest tests/test_install.py"));
    }
}
