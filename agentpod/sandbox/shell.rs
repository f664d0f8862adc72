//! Shell quoting and command-line construction for commands sent into a
//! sandbox.
//!
//! Every string that is spliced into a `sh -c` script passes through
//! [`shell_escape`], and every argv sent to the backend is produced by
//! [`build_command`]. Nothing else in the crate formats shell text.

use std::collections::BTreeMap;

use super::error::SandboxError;

/// Quote `s` for POSIX sh. Strings made only of safe characters are
/// returned as-is for readability.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b'/') {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// `[A-Za-z_][A-Za-z0-9_]*`. Anything else could smuggle shell syntax in
/// through the key half of `KEY=value`.
pub fn is_valid_env_key(key: &str) -> bool {
    let mut bytes = key.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Render an argv as a single human-readable (and sh-safe) line.
pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the argv for running `command args...` inside the sandbox.
///
/// * With `cwd`: `["sh", "-c", "cd <cwd> && exec env K=V <command> <args>"]`,
///   every interpolated piece escaped.
/// * Without `cwd`: the argv is passed straight through, prefixed by
///   `env K=V ...` when there are variables. No shell is involved, so
///   nothing needs escaping.
pub fn build_command(
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: Option<&str>,
) -> Result<Vec<String>, SandboxError> {
    if let Some(bad) = env.keys().find(|k| !is_valid_env_key(k)) {
        return Err(SandboxError::InvalidEnvKey(bad.clone()));
    }

    match cwd {
        Some(dir) => {
            let mut script = format!("cd {} && exec", shell_escape(dir));
            if !env.is_empty() {
                script.push_str(" env");
                for (k, v) in env {
                    script.push(' ');
                    script.push_str(k);
                    script.push('=');
                    script.push_str(&shell_escape(v));
                }
            }
            script.push(' ');
            script.push_str(&shell_escape(command));
            for arg in args {
                script.push(' ');
                script.push_str(&shell_escape(arg));
            }
            Ok(vec!["sh".into(), "-c".into(), script])
        }
        None => {
            let mut argv = Vec::with_capacity(env.len() + args.len() + 2);
            if !env.is_empty() {
                argv.push("env".to_string());
                argv.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
            }
            argv.push(command.to_string());
            argv.extend(args.iter().cloned());
            Ok(argv)
        }
    }
}

/// Fixed script for writing a base64 payload to a file. The path and the
/// payload travel as positional parameters, never as script text.
const WRITE_FILE_SCRIPT: &str =
    r#"mkdir -p "$(dirname "$1")" && printf '%s' "$2" | base64 -d > "$1""#;

pub fn write_file_command(path: &str, encoded: &str) -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        WRITE_FILE_SCRIPT.into(),
        "sh".into(),
        path.to_string(),
        encoded.to_string(),
    ]
}

pub fn read_file_command(path: &str) -> Vec<String> {
    vec!["base64".into(), path.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn shell_escape_basic() {
        assert_eq!(shell_escape("hello"), "hello");
        assert_eq!(shell_escape("hello world"), "'hello world'");
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("/workspace/app"), "/workspace/app");
    }

    #[test]
    fn shell_escape_quotes_and_metacharacters() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape("`whoami`"), "'`whoami`'");
        assert_eq!(shell_escape("a;b"), "'a;b'");
    }

    #[test]
    fn env_key_pattern() {
        assert!(is_valid_env_key("FOO"));
        assert!(is_valid_env_key("_private"));
        assert!(is_valid_env_key("A1_B2"));
        assert!(!is_valid_env_key(""));
        assert!(!is_valid_env_key("1ABC"));
        assert!(!is_valid_env_key("FOO;rm"));
        assert!(!is_valid_env_key("FOO BAR"));
        assert!(!is_valid_env_key("FOO=1"));
        assert!(!is_valid_env_key("$(x)"));
    }

    #[test]
    fn cwd_wraps_in_three_token_shell() {
        let argv = build_command(
            "node",
            &["index.js".into()],
            &env(&[("FOO", "bar")]),
            Some("/workspace/app"),
        )
        .unwrap();
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-c");
        assert!(argv[2].contains("cd /workspace/app"));
        assert!(argv[2].contains("FOO=bar"));
        assert_eq!(argv[2], "cd /workspace/app && exec env FOO=bar node index.js");
    }

    #[test]
    fn without_cwd_uses_env_prefix() {
        let argv =
            build_command("node", &["index.js".into()], &env(&[("FOO", "bar")]), None).unwrap();
        assert_eq!(argv, vec!["env", "FOO=bar", "node", "index.js"]);
    }

    #[test]
    fn without_cwd_or_env_passes_argv_through() {
        let argv = build_command("ls", &["-la".into(), "my dir".into()], &BTreeMap::new(), None)
            .unwrap();
        assert_eq!(argv, vec!["ls", "-la", "my dir"]);
    }

    #[test]
    fn hostile_values_are_escaped_inside_the_wrapper() {
        let argv = build_command(
            "echo",
            &["$(id)".into()],
            &env(&[("TOKEN", "a'b; rm -rf /")]),
            Some("/tmp/x y"),
        )
        .unwrap();
        assert_eq!(
            argv[2],
            "cd '/tmp/x y' && exec env TOKEN='a'\\''b; rm -rf /' echo '$(id)'"
        );
    }

    #[test]
    fn invalid_env_key_is_rejected() {
        let err = build_command("ls", &[], &env(&[("BAD;KEY", "x")]), None).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidEnvKey(k) if k == "BAD;KEY"));
    }

    #[test]
    fn file_commands_keep_paths_out_of_the_script() {
        let argv = write_file_command("/workspace/$(x).txt", "aGk=");
        assert_eq!(argv.len(), 6);
        assert!(!argv[2].contains("$(x)"));
        assert_eq!(argv[4], "/workspace/$(x).txt");
        assert_eq!(argv[5], "aGk=");
        assert_eq!(read_file_command("/a b"), vec!["base64", "/a b"]);
    }

    #[test]
    fn display_command_escapes_args() {
        let argv = vec!["echo".to_string(), "hi there".to_string()];
        assert_eq!(display_command(&argv), "echo 'hi there'");
    }
}
