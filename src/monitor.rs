//! Rule-based runtime monitor.
//!
//! Every check is evaluated against the configured rules in order. When
//! several rules fire, the most severe violation wins and ties go to the
//! earlier rule. Pairs failing validation raise a critical `invariant`
//! violation even when no configured rule asks for it, so a check never
//! reports success for an outcome the ledger records as failed. With
//! `auto_log` every outcome, pass or violation, is appended to the attached
//! ledger.

use crate::error::{NuError, NuResult};
use crate::kernel;
use crate::ledger::{AppendRequest, Ledger};
use crate::storage::{MemoryStorage, StorageBackend};
use crate::types::{content_digest, LedgerEntry, NuPair, Operation};
use crate::validator;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Severity of a monitor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn parse(s: &str) -> NuResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(NuError::ParseError {
                source: "level".to_string(),
                message: format!("unknown level '{}'", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a composite rule combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    /// Violated only when every child is violated.
    And,
    /// Violated as soon as one child is violated.
    Or,
}

/// A monitor rule. The set is closed; adding a kind means handling it in
/// every match below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Output must pass [`validator::validate`]. Always critical.
    Invariant,
    /// Violated iff `uncertainty / |nominal| > threshold`.
    Coverage { threshold: f64, level: Level },
    /// Violated iff `uncertainty > max_uncertainty`.
    Threshold { max_uncertainty: f64, level: Level },
    /// Short-circuit combination of child rules.
    Composite { logic: Logic, rules: Vec<Rule> },
}

/// A single rule failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub level: Level,
    pub rule: String,
    pub message: String,
}

impl Rule {
    pub fn coverage(threshold: f64, level: Level) -> Self {
        Self::Coverage { threshold, level }
    }

    pub fn threshold(max_uncertainty: f64, level: Level) -> Self {
        Self::Threshold { max_uncertainty, level }
    }

    pub fn all(rules: Vec<Rule>) -> Self {
        Self::Composite { logic: Logic::And, rules }
    }

    pub fn any(rules: Vec<Rule>) -> Self {
        Self::Composite { logic: Logic::Or, rules }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Invariant => "invariant",
            Self::Coverage { .. } => "coverage",
            Self::Threshold { .. } => "threshold",
            Self::Composite { logic: Logic::And, .. } => "all",
            Self::Composite { logic: Logic::Or, .. } => "any",
        }
    }

    /// Evaluate against an operation's output.
    pub fn evaluate(&self, output: &NuPair) -> Option<Violation> {
        match self {
            Self::Invariant => {
                if validator::validate_pair(output) {
                    None
                } else {
                    Some(Violation {
                        level: Level::Critical,
                        rule: self.name().to_string(),
                        message: format!(
                            "invariant violated: nominal={}, uncertainty={}",
                            output.nominal, output.uncertainty
                        ),
                    })
                }
            }
            Self::Coverage { threshold, level } => {
                let coverage = output.coverage();
                (coverage > *threshold).then(|| Violation {
                    level: *level,
                    rule: self.name().to_string(),
                    message: format!("coverage {} exceeds {}", coverage, threshold),
                })
            }
            Self::Threshold { max_uncertainty, level } => {
                (output.uncertainty > *max_uncertainty).then(|| Violation {
                    level: *level,
                    rule: self.name().to_string(),
                    message: format!(
                        "uncertainty {} exceeds {}",
                        output.uncertainty, max_uncertainty
                    ),
                })
            }
            Self::Composite { logic: Logic::Or, rules } => {
                rules.iter().find_map(|rule| rule.evaluate(output))
            }
            Self::Composite { logic: Logic::And, rules } => {
                let mut violations = Vec::with_capacity(rules.len());
                for rule in rules {
                    violations.push(rule.evaluate(output)?);
                }
                let level = violations.iter().map(|v| v.level).max()?;
                Some(Violation {
                    level,
                    rule: self.name().to_string(),
                    message: violations
                        .iter()
                        .map(|v| v.message.as_str())
                        .collect::<Vec<_>>()
                        .join(" and "),
                })
            }
        }
    }

    fn validate(&self, field: &str) -> NuResult<()> {
        let check = |value: f64, name: &str| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(NuError::InvalidConfig {
                    field: format!("{}.{}", field, name),
                    message: format!("must be finite and non-negative, got {}", value),
                })
            }
        };
        match self {
            Self::Invariant => Ok(()),
            Self::Coverage { threshold, .. } => check(*threshold, "threshold"),
            Self::Threshold { max_uncertainty, .. } => check(*max_uncertainty, "max_uncertainty"),
            Self::Composite { rules, .. } => {
                if rules.is_empty() {
                    return Err(NuError::InvalidConfig {
                        field: field.to_string(),
                        message: "composite rule needs at least one child".to_string(),
                    });
                }
                for (i, rule) in rules.iter().enumerate() {
                    rule.validate(&format!("{}.rules[{}]", field, i))?;
                }
                Ok(())
            }
        }
    }
}

/// Monitor configuration: ordered rules plus escalation flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub halt_on_critical: bool,
    #[serde(default)]
    pub auto_log: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rules: vec![Rule::Invariant],
            halt_on_critical: false,
            auto_log: false,
        }
    }
}

impl MonitorConfig {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    pub fn with_halt_on_critical(mut self, halt: bool) -> Self {
        self.halt_on_critical = halt;
        self
    }

    pub fn with_auto_log(mut self, auto_log: bool) -> Self {
        self.auto_log = auto_log;
        self
    }

    pub fn from_json(text: &str) -> NuResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NuResult<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate(&format!("rules[{}]", i))?;
        }
        Ok(())
    }

    /// Canonical SHA-256 of the configuration, suitable for signing.
    pub fn content_hash(&self) -> NuResult<[u8; 32]> {
        Ok(content_digest(&serde_json::to_value(self)?))
    }
}

/// A raised monitor event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub level: Level,
    pub operation: Operation,
    pub rule: String,
    pub message: String,
    /// Ledger entry recording this outcome, when auto-logged.
    pub op_id: Option<Uuid>,
}

/// Result of one monitored check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub output: NuPair,
    pub event: Option<Event>,
    pub entry: Option<LedgerEntry>,
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        self.event.is_none()
    }

    pub fn op_id(&self) -> Option<Uuid> {
        self.entry.as_ref().map(LedgerEntry::op_id)
    }
}

/// Lifetime counters, resettable without touching the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total_events: u64,
    pub violations_count: u64,
    pub critical_count: u64,
    pub logged_entries: u64,
}

pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

/// Evaluates rules against operation outputs and escalates violations.
pub struct Monitor<B: StorageBackend = MemoryStorage> {
    config: MonitorConfig,
    ledger: Option<Arc<Ledger<B>>>,
    handlers: Vec<EventHandler>,
    stats: Mutex<MonitorStats>,
    halted: AtomicBool,
}

impl Monitor<MemoryStorage> {
    /// Monitor without a ledger. Rejects configurations with `auto_log`.
    pub fn new(config: MonitorConfig) -> NuResult<Self> {
        Self::build(config, None)
    }
}

impl<B: StorageBackend> Monitor<B> {
    /// Monitor writing outcomes to `ledger` when `auto_log` is set.
    pub fn with_ledger(config: MonitorConfig, ledger: Arc<Ledger<B>>) -> NuResult<Self> {
        Self::build(config, Some(ledger))
    }

    fn build(config: MonitorConfig, ledger: Option<Arc<Ledger<B>>>) -> NuResult<Self> {
        config.validate()?;
        if config.auto_log && ledger.is_none() {
            return Err(NuError::InvalidConfig {
                field: "auto_log".to_string(),
                message: "auto_log requires an attached ledger".to_string(),
            });
        }
        Ok(Self {
            config,
            ledger,
            handlers: Vec::new(),
            stats: Mutex::new(MonitorStats::default()),
            halted: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn ledger(&self) -> Option<&Arc<Ledger<B>>> {
        self.ledger.as_ref()
    }

    /// Register a callback invoked for every raised event.
    pub fn add_handler(&mut self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Most severe violation among the configured rules; earlier rules win
    /// ties.
    pub fn evaluate(&self, output: &NuPair) -> Option<Violation> {
        most_severe(self.config.rules.iter().filter_map(|rule| rule.evaluate(output)))
    }

    /// Check an operation outcome, returning the raised event if any.
    pub fn check(
        &self,
        operation: &Operation,
        inputs: &[NuPair],
        output: NuPair,
    ) -> NuResult<Option<Event>> {
        Ok(self.check_with_parent(operation, inputs, output, None)?.event)
    }

    /// Check an outcome, logging it under `parent_id` when auto-logging.
    ///
    /// An invalid output or input always raises a critical `invariant`
    /// event, whatever rules are configured. Refused with `Halted` while the
    /// monitor is halted.
    pub fn check_with_parent(
        &self,
        operation: &Operation,
        inputs: &[NuPair],
        output: NuPair,
        parent_id: Option<Uuid>,
    ) -> NuResult<CheckOutcome> {
        self.ensure_running(operation)?;
        self.observe(operation, inputs, output, parent_id, None)
    }

    /// Run a kernel operation and check its result.
    ///
    /// Inputs failing validation never reach the kernel, and a kernel error
    /// is not propagated: either way the result becomes the collapse sentinel
    /// and the failure is recorded as an event.
    pub fn execute(
        &self,
        operation: &Operation,
        inputs: &[NuPair],
        parent_id: Option<Uuid>,
    ) -> NuResult<CheckOutcome> {
        self.ensure_running(operation)?;
        if input_violation(operation, inputs).is_some() {
            return self.observe(operation, inputs, NuPair::COLLAPSED, parent_id, None);
        }
        match kernel::apply(operation, inputs) {
            Ok(output) => self.observe(operation, inputs, output, parent_id, None),
            Err(e) => {
                let failure = Violation {
                    level: Level::Error,
                    rule: "kernel".to_string(),
                    message: e.to_string(),
                };
                self.observe(operation, inputs, NuPair::COLLAPSED, parent_id, Some(failure))
            }
        }
    }

    fn observe(
        &self,
        operation: &Operation,
        inputs: &[NuPair],
        output: NuPair,
        parent_id: Option<Uuid>,
        failure: Option<Violation>,
    ) -> NuResult<CheckOutcome> {
        let violation = most_severe(
            [
                failure,
                input_violation(operation, inputs),
                Rule::Invariant.evaluate(&output),
                self.evaluate(&output),
            ]
            .into_iter()
            .flatten(),
        );

        let mut event = violation.map(|v| Event {
            level: v.level,
            operation: operation.clone(),
            rule: v.rule,
            message: v.message,
            op_id: None,
        });

        let entry = if self.config.auto_log {
            Some(self.log(operation, inputs, output, parent_id, event.is_none())?)
        } else {
            None
        };
        if let (Some(ev), Some(entry)) = (event.as_mut(), entry.as_ref()) {
            ev.op_id = Some(entry.op_id());
        }

        self.record(event.as_ref(), entry.is_some())?;

        if let Some(ev) = &event {
            match ev.level {
                Level::Critical => error!(
                    operation = %operation,
                    rule = %ev.rule,
                    message = %ev.message,
                    "critical monitor event"
                ),
                Level::Error | Level::Warning => warn!(
                    operation = %operation,
                    level = %ev.level,
                    rule = %ev.rule,
                    message = %ev.message,
                    "monitor violation"
                ),
                Level::Info => info!(
                    operation = %operation,
                    rule = %ev.rule,
                    message = %ev.message,
                    "monitor event"
                ),
            }
            for handler in &self.handlers {
                handler(ev);
            }
            if ev.level == Level::Critical && self.config.halt_on_critical {
                self.halted.store(true, Ordering::Release);
                return Err(NuError::Halted {
                    operation: operation.to_string(),
                    message: match ev.op_id {
                        Some(id) => format!("{} (logged as {})", ev.message, id),
                        None => ev.message.clone(),
                    },
                });
            }
        } else {
            debug!(operation = %operation, "monitor check passed");
        }

        Ok(CheckOutcome { output, event, entry })
    }

    /// Append an outcome to the ledger. Invalid outputs are stored as the
    /// collapse sentinel with `invariant_passed = false`.
    fn log(
        &self,
        operation: &Operation,
        inputs: &[NuPair],
        output: NuPair,
        parent_id: Option<Uuid>,
        rules_passed: bool,
    ) -> NuResult<LedgerEntry> {
        let ledger = self.ledger.as_ref().ok_or_else(|| NuError::InvalidConfig {
            field: "auto_log".to_string(),
            message: "auto_log requires an attached ledger".to_string(),
        })?;
        let valid = validator::validate_pair(&output);
        let recorded = kernel::catch(output);
        let mut request = AppendRequest::new(operation.clone(), inputs.to_vec(), recorded)
            .with_invariant_passed(rules_passed && valid);
        request.parent_id = parent_id;
        ledger.append(request)
    }

    fn record(&self, event: Option<&Event>, logged: bool) -> NuResult<()> {
        let mut stats = self.stats.lock().map_err(|_| NuError::LockPoisoned {
            resource: "monitor stats".to_string(),
        })?;
        stats.total_events += 1;
        if let Some(ev) = event {
            stats.violations_count += 1;
            if ev.level == Level::Critical {
                stats.critical_count += 1;
            }
        }
        if logged {
            stats.logged_entries += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> NuResult<MonitorStats> {
        let stats = self.stats.lock().map_err(|_| NuError::LockPoisoned {
            resource: "monitor stats".to_string(),
        })?;
        Ok(*stats)
    }

    /// Zero the counters. Ledger history is untouched.
    pub fn reset_stats(&self) -> NuResult<()> {
        let mut stats = self.stats.lock().map_err(|_| NuError::LockPoisoned {
            resource: "monitor stats".to_string(),
        })?;
        *stats = MonitorStats::default();
        Ok(())
    }

    fn ensure_running(&self, operation: &Operation) -> NuResult<()> {
        if self.is_halted() {
            return Err(NuError::Halted {
                operation: operation.to_string(),
                message: "monitor is halted after a critical event".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Clear a halt raised by a critical event.
    pub fn resume(&self) {
        self.halted.store(false, Ordering::Release);
    }
}

/// Most severe violation; the earliest one wins ties.
fn most_severe(violations: impl IntoIterator<Item = Violation>) -> Option<Violation> {
    violations
        .into_iter()
        .fold(None, |worst: Option<Violation>, v| match worst {
            Some(w) if w.level >= v.level => Some(w),
            _ => Some(v),
        })
}

/// Critical violation for the first input that fails validation. `catch`
/// exists to absorb invalid values, so its inputs are exempt.
fn input_violation(operation: &Operation, inputs: &[NuPair]) -> Option<Violation> {
    if *operation == Operation::Catch {
        return None;
    }
    inputs.iter().enumerate().find_map(|(i, input)| {
        validator::assert_pair(input, operation.as_str())
            .err()
            .map(|e| Violation {
                level: Level::Critical,
                rule: Rule::Invariant.name().to_string(),
                message: format!("input #{}: {}", i, e),
            })
    })
}

impl<B: StorageBackend> std::fmt::Debug for Monitor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.config)
            .field("has_ledger", &self.ledger.is_some())
            .field("handlers", &self.handlers.len())
            .field("halted", &self.is_halted())
            .finish()
    }
}
