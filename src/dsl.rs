//! Line-oriented rule language producing a [`MonitorConfig`].
//!
//! ```text
//! # comments run to end of line
//! rule invariant
//! rule coverage > 0.1 level: warning
//! rule uncertainty > 5 level: error
//! rule any(coverage > 0.5 level: warning, all(uncertainty > 2, coverage > 1))
//! halt_on_critical: true
//! auto_log: true
//! ```

use crate::error::{NuError, NuResult};
use crate::monitor::{Level, Logic, MonitorConfig, Rule};
use regex::Regex;
use std::sync::OnceLock;

/// Level used by comparison rules that do not name one.
pub const DEFAULT_LEVEL: Level = Level::Warning;

/// Parser for the monitor rule language.
#[derive(Debug, Clone, Default)]
pub struct RuleDsl;

static COMPARISON_RE: OnceLock<Regex> = OnceLock::new();
static FLAG_RE: OnceLock<Regex> = OnceLock::new();

fn get_comparison_re() -> &'static Regex {
    COMPARISON_RE.get_or_init(|| {
        Regex::new(r"^(coverage|uncertainty)\s*>\s*(\S+?)(?:\s+level:\s*(\w+))?$")
            .expect("valid regex")
    })
}

fn get_flag_re() -> &'static Regex {
    FLAG_RE.get_or_init(|| {
        Regex::new(r"^(halt_on_critical|auto_log)\s*:\s*(\w+)$").expect("valid regex")
    })
}

impl RuleDsl {
    /// Parse a whole configuration document.
    pub fn parse_config(text: &str) -> NuResult<MonitorConfig> {
        let mut config = MonitorConfig::new(Vec::new());
        for (number, line) in Self::strip_comments(text) {
            if let Some(rest) = line.strip_prefix("rule ") {
                config.rules.push(Self::parse_rule(rest)?);
            } else if let Some(caps) = get_flag_re().captures(line) {
                let value = Self::parse_bool(&caps[2], number)?;
                match &caps[1] {
                    "halt_on_critical" => config.halt_on_critical = value,
                    _ => config.auto_log = value,
                }
            } else {
                return Err(Self::error(number, format!("unrecognized statement '{}'", line)));
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a single rule expression.
    pub fn parse_rule(expr: &str) -> NuResult<Rule> {
        let expr = expr.trim();
        if expr == "invariant" {
            return Ok(Rule::Invariant);
        }

        for (prefix, logic) in [("all(", Logic::And), ("any(", Logic::Or)] {
            if let Some(inner) = expr.strip_prefix(prefix) {
                let inner = inner.strip_suffix(')').ok_or_else(|| NuError::ParseError {
                    source: "rule".to_string(),
                    message: format!("unbalanced parentheses in '{}'", expr),
                })?;
                let rules = Self::split_top_level(inner)?
                    .into_iter()
                    .map(Self::parse_rule)
                    .collect::<NuResult<Vec<_>>>()?;
                return Ok(Rule::Composite { logic, rules });
            }
        }

        let caps = get_comparison_re()
            .captures(expr)
            .ok_or_else(|| NuError::ParseError {
                source: "rule".to_string(),
                message: format!("unknown rule '{}'", expr),
            })?;
        let limit: f64 = caps[2].parse().map_err(|_| NuError::ParseError {
            source: "rule".to_string(),
            message: format!("'{}' is not a number", &caps[2]),
        })?;
        let level = match caps.get(3) {
            Some(m) => Level::parse(m.as_str())?,
            None => DEFAULT_LEVEL,
        };
        Ok(match &caps[1] {
            "coverage" => Rule::coverage(limit, level),
            _ => Rule::threshold(limit, level),
        })
    }

    fn strip_comments(text: &str) -> Vec<(usize, &str)> {
        text.lines()
            .enumerate()
            .filter_map(|(i, line)| {
                let trimmed = match line.find('#') {
                    Some(pos) => line[..pos].trim(),
                    None => line.trim(),
                };
                if trimmed.is_empty() {
                    None
                } else {
                    Some((i + 1, trimmed))
                }
            })
            .collect()
    }

    /// Split on commas that are not nested inside parentheses.
    fn split_top_level(inner: &str) -> NuResult<Vec<&str>> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;
        for (i, c) in inner.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth = depth.checked_sub(1).ok_or_else(|| NuError::ParseError {
                        source: "rule".to_string(),
                        message: format!("unbalanced parentheses in '{}'", inner),
                    })?;
                }
                ',' if depth == 0 => {
                    parts.push(inner[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(NuError::ParseError {
                source: "rule".to_string(),
                message: format!("unbalanced parentheses in '{}'", inner),
            });
        }
        let last = inner[start..].trim();
        if !last.is_empty() || !parts.is_empty() {
            parts.push(last);
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(NuError::ParseError {
                source: "rule".to_string(),
                message: format!("empty operand in '{}'", inner),
            });
        }
        Ok(parts)
    }

    fn parse_bool(value: &str, line: usize) -> NuResult<bool> {
        match value {
            "true" | "yes" | "on" => Ok(true),
            "false" | "no" | "off" => Ok(false),
            other => Err(Self::error(line, format!("expected a boolean, got '{}'", other))),
        }
    }

    fn error(line: usize, message: String) -> NuError {
        NuError::ParseError {
            source: format!("line {}", line),
            message,
        }
    }
}
