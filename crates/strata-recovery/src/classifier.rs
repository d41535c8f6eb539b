//! Error classification
//!
//! An error is classified by the first rule family that recognises it:
//!
//! 1. learned rules, matched by message signature
//! 2. typed errors found anywhere in the source chain ([`strata_core::Error`]
//!    markers and [`std::io::Error`] kinds)
//! 3. the response status already written on the context
//! 4. message patterns
//!
//! Anything left is `Unknown`. Classification only reads learned state; the
//! statistics counters are its only side effect.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{Context, Error, Result, SharedError, StatusCode};
use tracing::{debug, info};

/// What kind of failure an error represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorCategory {
    /// Operation exceeded its deadline
    Timeout = 0,
    /// Transport-level failure
    Network = 1,
    /// Storage failure
    Database = 2,
    /// Bad input
    Validation = 3,
    /// Missing or rejected credentials
    Authentication = 4,
    /// Throttled by a limiter
    RateLimit = 5,
    /// Expected business-rule violation
    Business = 6,
    /// Failing dependency
    External = 7,
    /// Nothing matched
    Unknown = 8,
}

impl ErrorCategory {
    /// Every category
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Timeout,
        ErrorCategory::Network,
        ErrorCategory::Database,
        ErrorCategory::Validation,
        ErrorCategory::Authentication,
        ErrorCategory::RateLimit,
        ErrorCategory::Business,
        ErrorCategory::External,
        ErrorCategory::Unknown,
    ];

    /// Category name
    pub const fn name(self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Business => "business",
            ErrorCategory::External => "external",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Severity assigned when nothing more specific is known
    pub const fn default_severity(self) -> Severity {
        match self {
            ErrorCategory::Authentication | ErrorCategory::Database | ErrorCategory::External => {
                Severity::High
            }
            ErrorCategory::Business | ErrorCategory::Validation => Severity::Low,
            ErrorCategory::Timeout
            | ErrorCategory::Network
            | ErrorCategory::RateLimit
            | ErrorCategory::Unknown => Severity::Medium,
        }
    }

    /// Whether errors of this category are worth retrying
    pub const fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::Database
                | ErrorCategory::RateLimit
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErrorCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.name() == normalized || (normalized == "ratelimit" && *c == ErrorCategory::RateLimit))
            .ok_or_else(|| Error::not_found("error category", s))
    }
}

/// How bad an error is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected, harmless
    Low,
    /// Degrades a single request
    Medium,
    /// Degrades a subsystem
    High,
    /// Needs a human
    Critical,
}

impl Severity {
    /// Every severity, lowest first
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Severity name
    pub const fn name(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_ascii_lowercase();
        Severity::ALL
            .into_iter()
            .find(|sev| sev.name() == normalized)
            .ok_or_else(|| Error::not_found("severity", s))
    }
}

/// Which rule family produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Operator-taught rule
    Learned,
    /// Typed marker error
    Typed,
    /// `std::io::Error` kind
    Io,
    /// Response status on the context
    Status,
    /// Message pattern
    Pattern,
    /// No rule matched
    Fallback,
}

/// Category, severity and retryability assigned to one error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorClassification {
    /// Category
    pub category: ErrorCategory,
    /// Severity
    pub severity: Severity,
    /// Worth retrying
    pub retryable: bool,
    /// 0.0 to 1.0
    pub confidence: f64,
    /// Rule family that matched
    pub source: ClassificationSource,
    /// Normalised message signature
    pub signature: String,
}

impl ErrorClassification {
    fn with_defaults(
        category: ErrorCategory,
        confidence: f64,
        source: ClassificationSource,
        signature: String,
    ) -> Self {
        Self {
            category,
            severity: category.default_severity(),
            retryable: category.default_retryable(),
            confidence,
            source,
            signature,
        }
    }

    fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// A rule taught with [`ErrorClassifier::learn`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LearnedRule {
    /// Signature the rule matches
    pub signature: String,
    /// Category to assign
    pub category: ErrorCategory,
    /// Severity to assign
    pub severity: Severity,
    /// When the rule was learned
    pub learned_at: DateTime<Utc>,
}

/// Classification counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    /// Errors classified
    pub total: u64,
    /// Classifications served by learned rules
    pub learned_hits: u64,
    /// Learned rules currently held
    pub learned_rules: usize,
    /// Classifications per category
    pub by_category: BTreeMap<String, u64>,
}

static SIGNATURE_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            "<uuid>",
        ),
        (r"0x[0-9a-f]+", "<hex>"),
        (r#"'[^']*'|"[^"]*""#, "<str>"),
        (r"\d+(\.\d+)?", "<n>"),
        (r"\s+", " "),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

static MESSAGE_PATTERNS: Lazy<Vec<(ErrorCategory, Regex)>> = Lazy::new(|| {
    [
        (
            ErrorCategory::Timeout,
            r"(?i)(timed? ?out|timeout|deadline exceeded)",
        ),
        (
            ErrorCategory::RateLimit,
            r"(?i)(rate.?limit|too many requests|throttl|quota exceeded)",
        ),
        (
            ErrorCategory::Authentication,
            r"(?i)(unauthori[sz]ed|forbidden|authenticat|invalid token|token expired|permission denied|access denied)",
        ),
        (
            ErrorCategory::Database,
            r"(?i)(database|\bsql\b|deadlock|constraint violation|connection pool|\bdb\b)",
        ),
        (
            ErrorCategory::Network,
            r"(?i)(connection (refused|reset|closed|aborted)|network|unreachable|broken pipe|\bdns\b|socket)",
        ),
        (
            ErrorCategory::External,
            r"(?i)(upstream|external service|third.?party|bad gateway|service unavailable)",
        ),
        (
            ErrorCategory::Validation,
            r"(?i)(invalid|validation|malformed|required field|must be|missing (field|parameter))",
        ),
        (
            ErrorCategory::Business,
            r"(?i)(insufficient (funds|balance|stock)|business rule|out of stock|already exists)",
        ),
    ]
    .into_iter()
    .filter_map(|(category, pattern)| Regex::new(pattern).ok().map(|re| (category, re)))
    .collect()
});

/// Normalise a message so structurally similar errors share a signature.
///
/// Lowercases, then replaces UUIDs, hex literals, quoted strings and numbers
/// with placeholders.
pub fn signature(message: &str) -> String {
    let mut normalized = message.trim().to_lowercase();
    for (re, replacement) in SIGNATURE_RULES.iter() {
        normalized = re.replace_all(&normalized, *replacement).into_owned();
    }
    normalized
}

/// Maps errors to [`ErrorClassification`]s
#[derive(Debug)]
pub struct ErrorClassifier {
    learned: RwLock<HashMap<String, LearnedRule>>,
    total: AtomicU64,
    learned_hits: AtomicU64,
    by_category: [AtomicU64; 9],
}

impl ErrorClassifier {
    /// Create a classifier with no learned rules
    pub fn new() -> Self {
        Self {
            learned: RwLock::new(HashMap::new()),
            total: AtomicU64::new(0),
            learned_hits: AtomicU64::new(0),
            by_category: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Classify `err`, using the response status on `ctx` as a hint
    pub fn classify(
        &self,
        err: &(dyn StdError + 'static),
        ctx: Option<&Context>,
    ) -> ErrorClassification {
        let sig = signature(&err.to_string());

        let classification = self
            .lookup_learned(&sig)
            .or_else(|| from_chain(err, &sig))
            .or_else(|| ctx.and_then(|c| c.status()).and_then(|s| from_status(s, &sig)))
            .or_else(|| from_patterns(&err.to_string(), &sig))
            .unwrap_or_else(|| {
                ErrorClassification::with_defaults(
                    ErrorCategory::Unknown,
                    0.0,
                    ClassificationSource::Fallback,
                    sig.clone(),
                )
            });

        self.total.fetch_add(1, Ordering::Relaxed);
        self.by_category[classification.category.index()].fetch_add(1, Ordering::Relaxed);

        debug!(
            category = %classification.category,
            severity = %classification.severity,
            retryable = classification.retryable,
            source = ?classification.source,
            "Error classified"
        );
        classification
    }

    /// Classify a shared error
    pub fn classify_shared(&self, err: &SharedError, ctx: Option<&Context>) -> ErrorClassification {
        self.classify(err.as_ref(), ctx)
    }

    fn lookup_learned(&self, sig: &str) -> Option<ErrorClassification> {
        let learned = self.learned.read();
        let rule = learned.get(sig)?;
        self.learned_hits.fetch_add(1, Ordering::Relaxed);

        Some(
            ErrorClassification::with_defaults(
                rule.category,
                1.0,
                ClassificationSource::Learned,
                sig.to_string(),
            )
            .with_severity(rule.severity),
        )
    }

    /// Teach the classifier how errors shaped like `err` should be classified
    pub fn learn(&self, err: &(dyn StdError + 'static), category: ErrorCategory, severity: Severity) {
        self.learn_message(&err.to_string(), category, severity);
    }

    /// Teach the classifier by message text
    pub fn learn_message(&self, message: &str, category: ErrorCategory, severity: Severity) {
        let sig = signature(message);
        info!(signature = %sig, category = %category, severity = %severity, "Classification rule learned");
        self.learned.write().insert(
            sig.clone(),
            LearnedRule {
                signature: sig,
                category,
                severity,
                learned_at: Utc::now(),
            },
        );
    }

    /// Drop the learned rule matching `err`. Returns whether one existed.
    pub fn forget(&self, err: &(dyn StdError + 'static)) -> bool {
        self.learned.write().remove(&signature(&err.to_string())).is_some()
    }

    /// Learned rules, sorted by signature
    pub fn learned_rules(&self) -> Vec<LearnedRule> {
        let mut rules: Vec<LearnedRule> = self.learned.read().values().cloned().collect();
        rules.sort_by(|a, b| a.signature.cmp(&b.signature));
        rules
    }

    /// Current counters
    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            total: self.total.load(Ordering::Relaxed),
            learned_hits: self.learned_hits.load(Ordering::Relaxed),
            learned_rules: self.learned.read().len(),
            by_category: ErrorCategory::ALL
                .iter()
                .map(|c| {
                    (
                        c.name().to_string(),
                        self.by_category[c.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the source chain looking for a typed error
fn from_chain(err: &(dyn StdError + 'static), sig: &str) -> Option<ErrorClassification> {
    let mut current = Some(err);
    while let Some(e) = current {
        // A shared error hides the wrapped error from `source()`
        if let Some(shared) = e.downcast_ref::<SharedError>() {
            current = Some(shared.as_ref());
            continue;
        }
        if let Some(typed) = e.downcast_ref::<Error>() {
            if let Some(c) = from_typed(typed, sig) {
                return Some(c);
            }
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(c) = from_io(io_err, sig) {
                return Some(c);
            }
        }
        current = e.source();
    }
    None
}

fn from_typed(err: &Error, sig: &str) -> Option<ErrorClassification> {
    let typed = |category| {
        Some(ErrorClassification::with_defaults(
            category,
            0.95,
            ClassificationSource::Typed,
            sig.to_string(),
        ))
    };

    match err {
        Error::Timeout(_) => typed(ErrorCategory::Timeout),
        Error::Network(_) => typed(ErrorCategory::Network),
        Error::Database(_) => typed(ErrorCategory::Database),
        Error::Validation(_) => typed(ErrorCategory::Validation),
        Error::Authentication(_) => typed(ErrorCategory::Authentication),
        Error::RateLimited(_) => typed(ErrorCategory::RateLimit),
        Error::Business(_) => typed(ErrorCategory::Business),
        Error::External(_) => typed(ErrorCategory::External),
        Error::Panic(_) => typed(ErrorCategory::Unknown).map(|c| c.with_severity(Severity::Critical)),
        _ => None,
    }
}

fn from_io(err: &io::Error, sig: &str) -> Option<ErrorClassification> {
    use io::ErrorKind::*;

    let category = match err.kind() {
        TimedOut | WouldBlock => ErrorCategory::Timeout,
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | AddrInUse
        | AddrNotAvailable | BrokenPipe | UnexpectedEof => ErrorCategory::Network,
        InvalidInput | InvalidData => ErrorCategory::Validation,
        PermissionDenied => ErrorCategory::Authentication,
        _ => return None,
    };
    Some(ErrorClassification::with_defaults(
        category,
        0.9,
        ClassificationSource::Io,
        sig.to_string(),
    ))
}

fn from_status(status: StatusCode, sig: &str) -> Option<ErrorClassification> {
    let category = match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorCategory::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ErrorCategory::RateLimit,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorCategory::Authentication,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCategory::Validation,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => ErrorCategory::External,
        _ => return None,
    };
    Some(ErrorClassification::with_defaults(
        category,
        0.7,
        ClassificationSource::Status,
        sig.to_string(),
    ))
}

fn from_patterns(message: &str, sig: &str) -> Option<ErrorClassification> {
    MESSAGE_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(category, _)| {
            ErrorClassification::with_defaults(
                *category,
                0.6,
                ClassificationSource::Pattern,
                sig.to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Plain(&'static str);

    impl fmt::Display for Plain {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl StdError for Plain {}

    #[test]
    fn test_static_tables_compile() {
        assert_eq!(SIGNATURE_RULES.len(), 5);
        assert_eq!(MESSAGE_PATTERNS.len(), 8);
    }

    #[test]
    fn test_typed_markers() {
        let classifier = ErrorClassifier::new();

        let c = classifier.classify(&Error::Timeout("upstream".into()), None);
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert_eq!(c.severity, Severity::Medium);
        assert!(c.retryable);
        assert_eq!(c.source, ClassificationSource::Typed);

        let c = classifier.classify(&Error::Authentication("expired".into()), None);
        assert_eq!(c.severity, Severity::High);
        assert!(!c.retryable);

        let c = classifier.classify(&Error::Business("limit".into()), None);
        assert_eq!(c.severity, Severity::Low);
        assert!(!c.retryable);

        let c = classifier.classify(&Error::Panic("index out of bounds".into()), None);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_wrapped_errors_are_unwrapped() {
        let classifier = ErrorClassifier::new();
        let wrapped = Error::RecoveryExhausted {
            strategy: "db".to_string(),
            attempts: 2,
            source: Error::Database("deadlock detected".into()).into_shared(),
        };

        let c = classifier.classify(&wrapped, None);
        assert_eq!(c.category, ErrorCategory::Database);
        assert_eq!(c.source, ClassificationSource::Typed);
    }

    #[test]
    fn test_io_kinds() {
        let classifier = ErrorClassifier::new();
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let c = classifier.classify(&err, None);
        assert_eq!(c.category, ErrorCategory::Network);
        assert_eq!(c.source, ClassificationSource::Io);

        let shared: SharedError = Arc::new(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(
            classifier.classify_shared(&shared, None).category,
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn test_status_hint() {
        let classifier = ErrorClassifier::new();
        let mut ctx = Context::new();
        ctx.set_status(StatusCode::TOO_MANY_REQUESTS);

        let c = classifier.classify(&Plain("request rejected"), Some(&ctx));
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert_eq!(c.source, ClassificationSource::Status);
    }

    #[test]
    fn test_message_patterns() {
        let classifier = ErrorClassifier::new();
        let cases = [
            ("context deadline exceeded", ErrorCategory::Timeout),
            ("dial tcp: connection refused", ErrorCategory::Network),
            ("pq: deadlock detected", ErrorCategory::Database),
            ("invalid email address", ErrorCategory::Validation),
            ("invalid token", ErrorCategory::Authentication),
            ("insufficient funds", ErrorCategory::Business),
            ("upstream returned bad gateway", ErrorCategory::External),
        ];
        for (message, expected) in cases {
            let c = classifier.classify(&Plain(message), None);
            assert_eq!(c.category, expected, "{message}");
            assert_eq!(c.source, ClassificationSource::Pattern);
        }
    }

    #[test]
    fn test_unknown_fallback() {
        let classifier = ErrorClassifier::new();
        let c = classifier.classify(&Plain("something odd happened"), None);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.severity, Severity::Medium);
        assert!(!c.retryable);
        assert_eq!(c.source, ClassificationSource::Fallback);
    }

    #[test]
    fn test_learning_overrides_static_rules() {
        let classifier = ErrorClassifier::new();
        let original = Plain("order 1234 failed: lock wait on 'orders'");
        assert_eq!(classifier.classify(&original, None).category, ErrorCategory::Unknown);

        classifier.learn(&original, ErrorCategory::Database, Severity::High);

        let similar = Plain("order 98 failed: lock wait on 'invoices'");
        let c = classifier.classify(&similar, None);
        assert_eq!(c.category, ErrorCategory::Database);
        assert_eq!(c.severity, Severity::High);
        assert!(c.retryable);
        assert_eq!(c.source, ClassificationSource::Learned);

        // Learned rules win over typed markers
        let typed = Error::Timeout("cache".into());
        classifier.learn(&typed, ErrorCategory::External, Severity::Critical);
        assert_eq!(classifier.classify(&typed, None).category, ErrorCategory::External);

        assert!(classifier.forget(&similar));
        assert_eq!(classifier.classify(&original, None).category, ErrorCategory::Unknown);

        let stats = classifier.stats();
        assert_eq!(stats.learned_hits, 2);
        assert_eq!(stats.by_category["unknown"], 2);
    }

    #[test]
    fn test_signature_normalisation() {
        assert_eq!(
            signature("User 42 not found (id 550e8400-e29b-41d4-a716-446655440000)"),
            "user <n> not found (id <uuid>)"
        );
        assert_eq!(signature("Bad  value \"x\" at 0xFF"), "bad value <str> at <hex>");
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("rate_limit".parse::<ErrorCategory>().unwrap(), ErrorCategory::RateLimit);
        assert_eq!("RateLimit".parse::<ErrorCategory>().unwrap(), ErrorCategory::RateLimit);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("fatal".parse::<Severity>().is_err());
        assert!(Severity::Critical > Severity::High);
    }
}
