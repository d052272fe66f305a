use miette::{Diagnostic, LabeledSpan, SourceCode};
use thiserror::Error;

/// One problem found while validating a profile.
///
/// Validation collects every issue before failing so a profile author sees
/// the whole report at once rather than fixing one field per run.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Name of the binding the issue was found in.
    pub binding: String,
    /// Zero-based step index within the binding's sequence, when the issue
    /// is step-scoped.
    pub step: Option<usize>,
    /// What is wrong.
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step {
            Some(i) => write!(f, "binding '{}', step {}: {}", self.binding, i + 1, self.message),
            None => write!(f, "binding '{}': {}", self.binding, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to parse profile JSON")]
    ParseError {
        src: String,
        span: miette::SourceSpan,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid gesture timing: {message}")]
    InvalidTiming { message: String },

    #[error("{}", format_issues_message(.issues))]
    Invalid {
        /// Profile source for displaying context, when loaded from text.
        src: Option<String>,
        issues: Vec<ValidationIssue>,
    },

    #[error("Failed to read profile file")]
    Io(#[from] std::io::Error),
}

impl ProfileError {
    /// Build a parse error from a serde_json failure, locating the span from
    /// the reported line/column.
    pub fn from_json(src: &str, source: serde_json::Error) -> Self {
        let offset = offset_of(src, source.line(), source.column());
        ProfileError::ParseError {
            src: src.to_string(),
            span: (offset, 1).into(),
            source,
        }
    }
}

impl Diagnostic for ProfileError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let code = match self {
            ProfileError::ParseError { .. } => "keyweave::profile::parse_error",
            ProfileError::InvalidTiming { .. } => "keyweave::profile::invalid_timing",
            ProfileError::Invalid { .. } => "keyweave::profile::invalid",
            ProfileError::Io(_) => "keyweave::profile::io_error",
        };
        Some(Box::new(code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let help: Option<String> = match self {
            ProfileError::ParseError { .. } => Some(
                "Check the JSON syntax. Common issues: trailing commas, unquoted keys, or a missing closing brace."
                    .to_string(),
            ),
            ProfileError::InvalidTiming { .. } => Some(
                "Thresholds must satisfy longPressMax < superLongMin <= superLongMax < cancelThreshold."
                    .to_string(),
            ),
            ProfileError::Invalid { issues, .. } => {
                let mut help = String::from("Step rules:\n");
                help.push_str("  - bufferTier is one of low/medium/high, or give minDelay/maxDelay with minDelay >= 25 and maxDelay - minDelay >= 4\n");
                help.push_str("  - echoHits is 1-6\n");
                help.push_str("  - a dual key must name a different base than the primary\n");
                help.push_str("  - a sequence may touch at most 4 distinct base keys, at most 6 steps each\n");
                if issues.len() == 1 {
                    help.push_str(&format!("\n{}", issues[0]));
                }
                Some(help)
            }
            ProfileError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Some("Verify the profile path exists. Default location: ~/.config/keyweave/profile.json".to_string())
                }
                std::io::ErrorKind::PermissionDenied => {
                    Some("Check file permissions. The profile file must be readable.".to_string())
                }
                _ => None,
            },
        };
        help.map(|s| Box::new(s) as Box<dyn std::fmt::Display>)
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        match self {
            ProfileError::ParseError { src, .. } => Some(src as &dyn SourceCode),
            ProfileError::Invalid { src: Some(src), .. } => Some(src as &dyn SourceCode),
            _ => None,
        }
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        match self {
            ProfileError::ParseError { span, .. } => Some(Box::new(std::iter::once(
                LabeledSpan::new_with_span(Some("syntax error here".to_string()), *span),
            ))),
            _ => None,
        }
    }

    fn severity(&self) -> Option<miette::Severity> {
        Some(miette::Severity::Error)
    }
}

/// Byte offset of a 1-indexed line/column position within `src`.
fn offset_of(src: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (i, l) in src.split('\n').enumerate() {
        if i + 1 == line {
            return offset + column.saturating_sub(1).min(l.len());
        }
        offset += l.len() + 1;
    }
    src.len().saturating_sub(1)
}

fn format_issues_message(issues: &[ValidationIssue]) -> String {
    match issues {
        [] => "Profile validation failed".to_string(),
        [one] => format!("Invalid profile: {one}"),
        many => format!("Found {} problem(s) in profile", many.len()),
    }
}
