//! Structured reporting for broken invariants and dropped network data.
//!
//! Most failures in a prediction layer are not errors the caller can act on: a datagram
//! that does not decode, a snapshot that arrived after its tick left the history, a
//! connection that went silent. They are handled by dropping the data and carrying on,
//! but they are still worth seeing. Instead of scattering `tracing::warn!` calls, such
//! conditions are reported as [`SyncViolation`] records that can be:
//!
//! - logged via tracing (the default, through [`TracingObserver`])
//! - collected programmatically in tests ([`CollectingObserver`])
//! - forwarded to any custom [`ViolationObserver`]
//!
//! # Example
//!
//! ```
//! use rewind_sync::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // hand `observer.clone()` to a ClientSessionBuilder, run some ticks...
//! assert!(!observer.has_violation(ViolationKind::Reconciliation));
//! ```

use crate::Tick;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a violation.
///
/// Severities are ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the data was dropped or a fallback was used.
    Warning,
    /// Behavior is degraded, e.g. a connection was torn down.
    Error,
    /// An internal invariant is broken and state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Stable lowercase name, used as a tracing field value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation was detected in.
///
/// Marked `#[non_exhaustive]`; include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Tick history misuse, e.g. reading a tick that was already overwritten.
    TickHistory,
    /// A snapshot could not be reconciled (stale, from the future, wrong owner).
    Reconciliation,
    /// Malformed, unknown or oversized wire data.
    WireProtocol,
    /// Socket or connection level failures.
    Transport,
    /// Configuration constraint violated at runtime.
    Configuration,
    /// A bug in this crate.
    InternalError,
    /// A type's runtime invariant check failed.
    Invariant,
}

impl ViolationKind {
    /// Stable lowercase name, used as a tracing field value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TickHistory => "tick_history",
            Self::Reconciliation => "reconciliation",
            Self::WireProtocol => "wire_protocol",
            Self::Transport => "transport",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with enough context to diagnose it.
///
/// Implements `serde::Serialize`; the tick is written as a plain integer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// What went wrong.
    pub message: String,
    /// `file:line` of the report site.
    pub location: &'static str,
    /// The simulation tick involved, if any.
    pub tick: Option<Tick>,
    /// Extra `key = value` pairs, rendered in key order.
    pub context: BTreeMap<String, String>,
}

impl SyncViolation {
    /// Creates a new violation record.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            tick: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the tick at which this violation occurred.
    #[must_use]
    pub fn with_tick(mut self, tick: Tick) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Compact JSON, or `None` if serialization fails.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Indented JSON, or `None` if serialization fails.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for SyncViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(tick) = self.tick {
            write!(f, ", tick={tick}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations as they are detected.
///
/// Must be cheap: it is called from the tick loop and from transport threads.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected.
    fn on_violation(&self, violation: &SyncViolation);
}

/// Receives violations as they are detected.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called when a violation is detected.
    fn on_violation(&self, violation: &SyncViolation);
}

/// Default observer: logs through `tracing` with structured fields
/// (`severity`, `kind`, `location`, `tick`, `context`).
///
/// `Warning` maps to `tracing::warn!`; `Error` and `Critical` map to `tracing::error!`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, v: &SyncViolation) {
        // Absent ticks are left out of the event rather than printed as a sentinel.
        let tick = v.tick.map(Tick::as_u32);
        let context = (!v.context.is_empty()).then(|| {
            v.context
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(" ")
        });
        let message = v.message.as_str();
        if v.severity == ViolationSeverity::Warning {
            tracing::warn!(
                severity = v.severity.as_str(),
                kind = v.kind.as_str(),
                location = v.location,
                tick,
                context = context.as_deref(),
                "{message}"
            );
        } else {
            tracing::error!(
                severity = v.severity.as_str(),
                kind = v.kind.as_str(),
                location = v.location,
                tick,
                context = context.as_deref(),
                "{message}"
            );
        }
    }
}

/// Observer that stores every violation, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<SyncViolation>>,
}

impl CollectingObserver {
    /// An observer that has seen nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Everything seen so far, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<SyncViolation> {
        self.violations.lock().clone()
    }

    /// Number of violations seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns `true` if nothing was seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns `true` if at least one violation of `kind` was seen.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Violations of `kind` only.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<SyncViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Violations at `min_severity` or worse.
    #[must_use]
    pub fn violations_at_severity(&self, min_severity: ViolationSeverity) -> Vec<SyncViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Forgets everything seen so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &SyncViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards every violation to several observers, in order.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Fans out to `observers`, in order.
    #[must_use]
    pub fn from_observers(observers: Vec<Arc<dyn ViolationObserver>>) -> Self {
        Self { observers }
    }

    /// Appends another observer.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &SyncViolation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Reports a violation through [`TracingObserver`], recording the current file and line.
///
/// ```
/// use rewind_sync::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// let len = 3;
/// report_violation!(ViolationSeverity::Warning, ViolationKind::WireProtocol,
///     "dropped {}-byte datagram", len);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $($message:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        $crate::telemetry::TracingObserver.on_violation(&$crate::telemetry::SyncViolation::new(
            $severity,
            $kind,
            format!($($message)+),
            concat!(file!(), ":", line!()),
        ));
    }};
}

/// Reports a fully built [`SyncViolation`] to an optional observer, falling back to
/// [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &SyncViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Like [`report_violation!`], but routed through an `Option<Arc<dyn ViolationObserver>>`.
///
/// An optional `tick = expr;` prefix attaches the tick to the record.
///
/// ```
/// use rewind_sync::{report_violation_to, Tick};
/// use rewind_sync::telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity};
/// use std::sync::Arc;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
/// report_violation_to!(&observer, tick = Tick::new(12); ViolationSeverity::Warning,
///     ViolationKind::Reconciliation, "snapshot for tick {} is stale", 12);
/// assert_eq!(collector.violations()[0].tick, Some(Tick::new(12)));
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, tick = $tick:expr; $severity:expr, $kind:expr, $($message:tt)+) => {
        $crate::telemetry::report_to_observer(
            $observer.as_ref(),
            &$crate::telemetry::SyncViolation::new(
                $severity,
                $kind,
                format!($($message)+),
                concat!(file!(), ":", line!()),
            )
            .with_tick($tick),
        )
    };

    ($observer:expr, $severity:expr, $kind:expr, $($message:tt)+) => {
        $crate::telemetry::report_to_observer(
            $observer.as_ref(),
            &$crate::telemetry::SyncViolation::new(
                $severity,
                $kind,
                format!($($message)+),
                concat!(file!(), ":", line!()),
            ),
        )
    };
}

/// Panics if a [`CollectingObserver`] saw anything.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "{} unexpected violation(s): {:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Panics unless a [`CollectingObserver`] saw a violation of the given kind.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "no {:?} violation among {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// Description of a broken invariant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// Type that failed its check.
    pub type_name: &'static str,
    /// The invariant that no longer holds.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// A broken `invariant` on `type_name`.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Attaches free-form details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types that maintain internal invariants and can check them at runtime.
pub trait InvariantChecker {
    /// Returns `Ok(())` if all invariants hold, or the first broken one.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports a
/// `Critical` violation if one is broken. Compiles to nothing otherwise.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr $(, $context:expr)?) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(broken) = $expr.check_invariants() {
            let mut message = broken.to_string();
            $( message.push_str(&format!(" [{}]", $context)); )?
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{}",
                message
            );
        }
    }};
}

/// Compiled out unless `debug_assertions` or `paranoid` is on.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr $(, $context:expr)?) => {{}};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn violation(severity: ViolationSeverity, kind: ViolationKind) -> SyncViolation {
        SyncViolation::new(severity, kind, "test", "test.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ViolationKind::TickHistory.as_str(), "tick_history");
        assert_eq!(ViolationKind::Reconciliation.as_str(), "reconciliation");
        assert_eq!(ViolationKind::WireProtocol.as_str(), "wire_protocol");
        assert_eq!(ViolationKind::Transport.as_str(), "transport");
        assert_eq!(ViolationKind::Invariant.to_string(), "invariant");
    }

    #[test]
    fn builder_sets_tick_and_context() {
        let v = violation(ViolationSeverity::Warning, ViolationKind::Reconciliation)
            .with_tick(Tick::new(95))
            .with_context("oldest", "37");
        assert_eq!(v.tick, Some(Tick::new(95)));
        assert_eq!(v.context.get("oldest").map(String::as_str), Some("37"));

        let display = v.to_string();
        assert!(display.contains("warning/reconciliation"));
        assert!(display.contains("tick=95"));
        assert!(display.contains("oldest"));
    }

    #[test]
    fn collecting_observer_filters() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());
        observer.on_violation(&violation(
            ViolationSeverity::Warning,
            ViolationKind::WireProtocol,
        ));
        observer.on_violation(&violation(
            ViolationSeverity::Error,
            ViolationKind::Transport,
        ));
        observer.on_violation(&violation(
            ViolationSeverity::Warning,
            ViolationKind::WireProtocol,
        ));

        assert_eq!(observer.len(), 3);
        assert_eq!(
            observer
                .violations_of_kind(ViolationKind::WireProtocol)
                .len(),
            2
        );
        assert_eq!(
            observer
                .violations_at_severity(ViolationSeverity::Error)
                .len(),
            1
        );
        assert!(!observer.has_violation(ViolationKind::TickHistory));

        observer.clear();
        assert_no_violations!(observer);
    }

    #[test]
    fn composite_forwards_to_all() {
        let a = Arc::new(CollectingObserver::new());
        let b = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::from_observers(vec![a.clone()]);
        composite.add(b.clone());
        composite.on_violation(&violation(
            ViolationSeverity::Critical,
            ViolationKind::Invariant,
        ));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert!(format!("{composite:?}").contains("observers: 2"));
    }

    #[test]
    fn report_violation_to_uses_observer_and_tick() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            tick = Tick::new(7);
            ViolationSeverity::Warning,
            ViolationKind::TickHistory,
            "slot {} overwritten",
            3
        );
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::Transport,
            "gone"
        );
        let collected = collector.violations();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].tick, Some(Tick::new(7)));
        assert_eq!(collected[0].message, "slot 3 overwritten");
        assert_eq!(collected[1].tick, None);
        assert_violation!(collector, ViolationKind::Transport);
    }

    #[test]
    fn report_violation_to_none_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::WireProtocol,
            "logged only"
        );
    }

    #[test]
    fn invariant_violation_display() {
        let v = InvariantViolation::new("TickHistory", "capacity is not a power of two")
            .with_details("capacity=48");
        assert_eq!(
            v.to_string(),
            "TickHistory: capacity is not a power of two (capacity=48)"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_output_has_plain_tick() {
        let v = violation(ViolationSeverity::Warning, ViolationKind::Reconciliation)
            .with_tick(Tick::new(42));
        let json = v.to_json().unwrap();
        assert!(json.contains(r#""tick":42"#));
        assert!(json.contains(r#""kind":"reconciliation""#));
    }
}
