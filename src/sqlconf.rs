//! Parsing and rendering of the PHP database connection file.
//!
//! The file is owned by the application, so only the five connection
//! assignments are touched; everything else is preserved byte for byte.
//!
//! ```
//! use slotmux::{sqlconf, DbCredential};
//!
//! let content = "<?php\n$host = 'db.internal';\n$port = '3306';\n$login = 'openemr_a';\n$pass = 'p1';\n$dbase = 'openemr';\n";
//! let parsed = sqlconf::parse(content);
//! assert_eq!(parsed.login.as_deref(), Some("openemr_a"));
//!
//! let next = DbCredential::new("openemr_b", "p2", "db.internal", 3306, "openemr");
//! let rendered = sqlconf::render(content, &next).unwrap();
//! assert!(rendered.contains("$login = 'openemr_b';"));
//! assert!(sqlconf::parse(&rendered).matches(&next));
//! ```

use regex::Regex;
use std::sync::LazyLock;

use crate::slot::{DbCredential, DEFAULT_PORT};
use crate::{Result, RotationError};

/// PHP variable names, in the order they are rendered.
const VARIABLES: [&str; 5] = ["host", "port", "login", "pass", "dbase"];

static PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    VARIABLES
        .iter()
        .map(|var| {
            let pattern = format!(r#"(?m)^(\${var}\s*=\s*['"])([^'"]+)(['"]\s*;)"#);
            // Assembled from fixed variable names, so it always compiles.
            let regex = Regex::new(&pattern).expect("sqlconf pattern is valid");
            (*var, regex)
        })
        .collect()
});

fn pattern_for(var: &str) -> Option<&'static Regex> {
    PATTERNS
        .iter()
        .find(|(name, _)| *name == var)
        .map(|(_, regex)| regex)
}

/// Connection values found in the file. Absent assignments are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    /// `$host`
    pub host: Option<String>,
    /// `$port`
    pub port: Option<String>,
    /// `$login`
    pub login: Option<String>,
    /// `$pass`
    pub pass: Option<String>,
    /// `$dbase`
    pub dbase: Option<String>,
}

impl ParsedConfig {
    /// Returns true when all five values equal the credential's.
    ///
    /// A missing `$port` counts as the default port.
    pub fn matches(&self, credential: &DbCredential) -> bool {
        let port = self
            .port
            .clone()
            .unwrap_or_else(|| DEFAULT_PORT.to_string());

        self.host.as_deref() == Some(credential.host.as_str())
            && port == credential.port.to_string()
            && self.login.as_deref() == Some(credential.username.as_str())
            && self.pass.as_deref() == Some(credential.password.as_str())
            && self.dbase.as_deref() == Some(credential.database_name.as_str())
    }

    /// Port as a number, if present and valid.
    pub fn port_number(&self) -> Option<u16> {
        self.port.as_deref().and_then(|p| p.trim().parse().ok())
    }

    /// The credential the file describes, if every value except the port is
    /// present.
    pub fn credential(&self) -> Option<DbCredential> {
        Some(DbCredential::new(
            self.login.clone()?,
            self.pass.clone()?,
            self.host.clone()?,
            self.port_number().unwrap_or(DEFAULT_PORT),
            self.dbase.clone()?,
        ))
    }
}

/// Extracts the connection assignments from `content`.
///
/// Parsing is best effort: a missing or malformed assignment leaves its field
/// empty rather than failing.
pub fn parse(content: &str) -> ParsedConfig {
    let value_of = |var: &str| {
        pattern_for(var)
            .and_then(|regex| regex.captures(content))
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str().to_string())
    };

    ParsedConfig {
        host: value_of("host"),
        port: value_of("port"),
        login: value_of("login"),
        pass: value_of("pass"),
        dbase: value_of("dbase"),
    }
}

/// Replaces the first occurrence of each connection assignment.
///
/// # Errors
///
/// Returns [`RotationError::ConfigFile`] if an assignment is missing or a
/// value cannot be represented inside a quoted PHP string.
pub fn render(content: &str, credential: &DbCredential) -> Result<String> {
    let port = credential.port.to_string();
    let replacements = [
        ("host", credential.host.as_str()),
        ("port", port.as_str()),
        ("login", credential.username.as_str()),
        ("pass", credential.password.as_str()),
        ("dbase", credential.database_name.as_str()),
    ];

    let mut updated = content.to_string();
    for (var, value) in replacements {
        if value.is_empty() || value.contains(['\'', '"', '\\', '\n', '\r']) {
            return Err(render_error(format!(
                "value for ${var} cannot be written to sqlconf.php"
            )));
        }

        let span = pattern_for(var)
            .and_then(|regex| regex.captures(&updated))
            .and_then(|caps| caps.get(2))
            .map(|m| m.range())
            .ok_or_else(|| render_error(format!("unable to locate ${var} assignment")))?;

        updated.replace_range(span, value);
    }

    Ok(updated)
}

fn render_error(reason: String) -> RotationError {
    RotationError::ConfigFile {
        path: "sqlconf.php".into(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?php
//  OpenEMR
//  MySQL Config

$host   = 'db.cluster.internal';
$port   = '3306';
$login  = 'openemr_a';
$pass   = 'p1';
$dbase  = 'openemr';
$db_encoding = 'utf8mb4';

$sqlconf = array();
global $sqlconf;
$sqlconf["host"]= $host;
$sqlconf["port"] = $port;
$sqlconf["login"] = $login;
$sqlconf["pass"] = $pass;
$sqlconf["dbase"] = $dbase;
$config = 1;
"#;

    fn slot_a() -> DbCredential {
        DbCredential::new("openemr_a", "p1", "db.cluster.internal", 3306, "openemr")
    }

    fn slot_b() -> DbCredential {
        DbCredential::new("openemr_b", "p2", "db.cluster.internal", 3306, "openemr")
    }

    #[test]
    fn test_parse_sample() {
        let parsed = parse(SAMPLE);
        assert_eq!(parsed.host.as_deref(), Some("db.cluster.internal"));
        assert_eq!(parsed.port_number(), Some(3306));
        assert_eq!(parsed.login.as_deref(), Some("openemr_a"));
        assert_eq!(parsed.pass.as_deref(), Some("p1"));
        assert_eq!(parsed.dbase.as_deref(), Some("openemr"));
        assert!(parsed.matches(&slot_a()));
        assert!(!parsed.matches(&slot_b()));
        assert_eq!(parsed.credential(), Some(slot_a()));
    }

    #[test]
    fn test_parse_double_quotes_and_spacing() {
        let content = "$host=\"h\";\n$login = \"u\" ;\n$pass =\t'x';\n";
        let parsed = parse(content);
        assert_eq!(parsed.host.as_deref(), Some("h"));
        assert_eq!(parsed.login.as_deref(), Some("u"));
        assert_eq!(parsed.pass.as_deref(), Some("x"));
        assert_eq!(parsed.port, None);
        assert_eq!(parsed.dbase, None);
    }

    #[test]
    fn test_parse_is_line_anchored() {
        let content = "  // $login = 'commented';\n$login = 'real';\n";
        assert_eq!(parse(content).login.as_deref(), Some("real"));
    }

    #[test]
    fn test_missing_port_matches_default() {
        let content = "$host = 'db.cluster.internal';\n$login = 'openemr_a';\n$pass = 'p1';\n$dbase = 'openemr';\n";
        assert!(parse(content).matches(&slot_a()));
    }

    #[test]
    fn test_render_preserves_other_content() {
        let rendered = render(SAMPLE, &slot_b()).unwrap();
        assert!(rendered.contains("$login  = 'openemr_b';"));
        assert!(rendered.contains("$pass   = 'p2';"));
        assert!(rendered.contains("$db_encoding = 'utf8mb4';"));
        assert!(rendered.contains("$sqlconf[\"login\"] = $login;"));
        assert_eq!(rendered.lines().count(), SAMPLE.lines().count());

        let back = render(&rendered, &slot_a()).unwrap();
        assert_eq!(back, SAMPLE);
    }

    #[test]
    fn test_render_replaces_first_occurrence_only() {
        let content = "$host = 'a';\n$port = '1';\n$login = 'u';\n$pass = 'p';\n$dbase = 'd';\n$pass = 'second';\n";
        let rendered = render(content, &slot_b()).unwrap();
        assert!(rendered.contains("$pass = 'p2';"));
        assert!(rendered.contains("$pass = 'second';"));
    }

    #[test]
    fn test_render_missing_assignment_fails() {
        let content = "$host = 'a';\n$login = 'u';\n$pass = 'p';\n$dbase = 'd';\n";
        let err = render(content, &slot_b()).unwrap_err();
        assert!(err.to_string().contains("$port"));
    }

    #[test]
    fn test_render_rejects_quotes_in_values() {
        let bad = slot_b().with_password("it's");
        assert!(render(SAMPLE, &bad).is_err());
    }
}
