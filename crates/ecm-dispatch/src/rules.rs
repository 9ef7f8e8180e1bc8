use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ecm_blob::Blob;
use ecm_types::ProviderId;

use crate::dispatcher::{BlobDispatch, BlobDispatcher, DocumentContext};
use crate::error::{DispatchError, DispatchResult};

// ---------------------------------------------------------------------------
// Rule configuration
// ---------------------------------------------------------------------------

/// Comparison operator of a rule clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    /// Glob with `*` and `?`.
    #[serde(rename = "~")]
    Glob,
    /// Regular expression matching the whole value.
    #[serde(rename = "^")]
    Regex,
}

/// `field op value`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub op: Operator,
    pub value: String,
}

impl Clause {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

/// Route to `provider` when every condition holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRule {
    pub provider: ProviderId,
    #[serde(default)]
    pub conditions: Vec<Clause>,
}

impl DispatchRule {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            conditions: Vec::new(),
        }
    }

    pub fn when(mut self, field: impl Into<String>, op: Operator, value: impl Into<String>) -> Self {
        self.conditions.push(Clause::new(field, op, value));
        self
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum Field {
    MimeType,
    Name,
    Length,
    XPath,
    Repository,
    PrimaryType,
    IsRecord,
    Property(String),
}

impl Field {
    fn parse(name: &str) -> DispatchResult<Self> {
        Ok(match name {
            "blob:mime-type" => Self::MimeType,
            "blob:name" => Self::Name,
            "blob:length" => Self::Length,
            "blob:xpath" => Self::XPath,
            "ecm:repositoryName" => Self::Repository,
            "ecm:primaryType" => Self::PrimaryType,
            "ecm:isRecord" => Self::IsRecord,
            "" => return Err(DispatchError::config("empty field name in dispatch rule")),
            other => Self::Property(other.to_string()),
        })
    }

    fn value(&self, blob: &Blob, doc: &DocumentContext<'_>, xpath: &str) -> Option<String> {
        match self {
            Self::MimeType => blob.mime_type.clone(),
            Self::Name => blob.filename.clone(),
            Self::Length => Some(blob.length().to_string()),
            Self::XPath => Some(xpath.to_string()),
            Self::Repository => Some(doc.repository.to_string()),
            Self::PrimaryType => Some(doc.doc_type.to_string()),
            Self::IsRecord => Some(doc.is_record.to_string()),
            Self::Property(name) => doc.properties.get(name).cloned(),
        }
    }
}

#[derive(Clone, Debug)]
struct CompiledClause {
    field: Field,
    op: Operator,
    value: String,
    pattern: Option<Regex>,
}

impl CompiledClause {
    fn compile(clause: &Clause) -> DispatchResult<Self> {
        let pattern = match clause.op {
            Operator::Regex => Some(anchored(&clause.value)?),
            Operator::Glob => Some(anchored(&glob_to_regex(&clause.value))?),
            _ => None,
        };
        Ok(Self {
            field: Field::parse(&clause.field)?,
            op: clause.op,
            value: clause.value.clone(),
            pattern,
        })
    }

    /// A missing field only satisfies `!=`.
    fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return self.op == Operator::NotEq;
        };
        match self.op {
            Operator::Eq => actual == self.value,
            Operator::NotEq => actual != self.value,
            Operator::Lt => compare(actual, &self.value) == Ordering::Less,
            Operator::Gt => compare(actual, &self.value) == Ordering::Greater,
            Operator::Glob | Operator::Regex => {
                self.pattern.as_ref().is_some_and(|p| p.is_match(actual))
            }
        }
    }
}

fn anchored(pattern: &str) -> DispatchResult<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| DispatchError::config(format!("invalid pattern {pattern:?}: {e}")))
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out
}

/// Numeric when both sides parse as numbers, lexicographic otherwise.
fn compare(actual: &str, expected: &str) -> Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    provider: ProviderId,
    clauses: Vec<CompiledClause>,
}

// ---------------------------------------------------------------------------
// RuleDispatcher
// ---------------------------------------------------------------------------

/// Ordered rules over blob and document metadata; the first matching rule
/// wins, the default provider applies otherwise.
#[derive(Clone, Debug)]
pub struct RuleDispatcher {
    ids: Vec<ProviderId>,
    rules: Vec<CompiledRule>,
}

impl RuleDispatcher {
    pub fn new(default: ProviderId, rules: Vec<DispatchRule>) -> DispatchResult<Self> {
        let mut ids = vec![default];
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in &rules {
            let clauses = rule
                .conditions
                .iter()
                .map(CompiledClause::compile)
                .collect::<DispatchResult<Vec<_>>>()?;
            if !ids.contains(&rule.provider) {
                ids.push(rule.provider.clone());
            }
            compiled.push(CompiledRule {
                provider: rule.provider.clone(),
                clauses,
            });
        }
        Ok(Self {
            ids,
            rules: compiled,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn add_prefix(&self) -> bool {
        self.ids.len() > 1
    }
}

impl BlobDispatcher for RuleDispatcher {
    fn provider_ids(&self) -> &[ProviderId] {
        &self.ids
    }

    fn default_provider(&self, _repository: &str) -> &ProviderId {
        &self.ids[0]
    }

    fn dispatch(&self, blob: &Blob, doc: &DocumentContext<'_>, xpath: &str) -> BlobDispatch {
        let target = self
            .rules
            .iter()
            .find(|rule| {
                rule.clauses.iter().all(|clause| {
                    let actual = clause.field.value(blob, doc, xpath);
                    clause.matches(actual.as_deref())
                })
            })
            .map(|rule| &rule.provider)
            .unwrap_or(&self.ids[0]);
        debug!(xpath, doc = %doc.doc_id, provider = %target, "blob dispatched by rules");
        BlobDispatch::for_blob(target.clone(), self.add_prefix(), blob)
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}
