use std::fmt;

use serde::Serialize;

/// Compliance verdict for a single call site.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum Verdict {
    Pass,
    Fail,
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Positional argument captured at a call site. `literal` is present iff the
/// value was resolved to a string constant; `printable` is always set.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ArgumentValue {
    pub(crate) index: usize,
    pub(crate) printable: String,
    pub(crate) literal: Option<String>,
}

impl ArgumentValue {
    pub(crate) fn resolved(index: usize, literal: impl Into<String>) -> Self {
        let literal = literal.into();
        Self {
            index,
            printable: literal.clone(),
            literal: Some(literal),
        }
    }

    pub(crate) fn unresolved(index: usize) -> Self {
        Self {
            index,
            printable: format!("arg{index}"),
            literal: None,
        }
    }
}

/// Source position of a call site. `line` is -1 when unknown.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Location {
    pub(crate) class_name: String,
    pub(crate) method_signature: String,
    pub(crate) source_file: String,
    pub(crate) line: i32,
}

/// A discovered call site of a catalog API, independent of any policy.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Finding {
    /// `"<declaringClass>.<methodName>"`, matched against rule `api` fields.
    pub(crate) api: String,
    pub(crate) declaring_class: String,
    pub(crate) method_name: String,
    pub(crate) sub_signature: String,
    pub(crate) args: Vec<ArgumentValue>,
    pub(crate) location: Location,
}

impl Finding {
    pub(crate) fn algorithm_printable(&self) -> &str {
        self.args
            .first()
            .map(|arg| arg.printable.as_str())
            .unwrap_or("None")
    }

    pub(crate) fn provider_printable(&self) -> &str {
        self.args
            .get(1)
            .map(|arg| arg.printable.as_str())
            .unwrap_or("None")
    }
}

/// Verdict and reasoning derived by applying a policy to a finding.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Analysis {
    pub(crate) finding: Finding,
    pub(crate) policy_id: String,
    pub(crate) rule_id: String,
    pub(crate) verdict: Verdict,
    pub(crate) reason: Option<String>,
}
