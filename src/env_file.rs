//! `--env-file` handling: `KEY=value` lines loaded into the process environment before
//! logging and config are initialised. Variables already set in the environment win.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    /// Named on the command line rather than found as `./.env`.
    pub explicit: bool,
}

/// Picks the env file from `args` (program name already skipped), falling back to `./.env`.
pub fn env_file_from_args(args: impl IntoIterator<Item = OsString>) -> Result<Option<PathBuf>, String> {
    let mut args = args.into_iter();
    let mut chosen: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let path = if arg == "--env-file" {
            args.next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            if value.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            PathBuf::from(value)
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        if chosen.replace(path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(chosen)
}

pub fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = env_file_from_args(std::env::args_os().skip(1))? {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let path = cwd.join(".env");
    if !path.is_file() {
        return Ok(None);
    }
    load(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit: false }))
}

fn load(path: &Path) -> Result<(), String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse(&content).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // SAFETY: called from main before any other thread exists.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parses a whole file. Errors are prefixed with their 1-based line number.
pub fn parse(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| format!("{}: {}", index + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        // unquoted: an inline comment ends the value
        let value = raw.split('#').next().unwrap_or_default();
        return Ok(value.trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if quote == '"' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = raw[1 + i + 1..].trim();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(value);
                }
                return Err(format!("unexpected characters after closing quote: {}", rest));
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}
