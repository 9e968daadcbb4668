use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod expectations;
mod record;
mod tile;

pub use expectations::Expectations;
pub use record::{TriageDelta, TriageLogDetail, TriageLogEntry, TriageRecord};
pub use tile::{Commit, ParamSet, Tile, TileError, Trace};

pub type Digest = String;
pub type TestName = String;
pub type TraceId = String;
pub type Params = BTreeMap<String, String>;

/// Param key holding the test name; traces are grouped for triage by it.
pub const PRIMARY_KEY_FIELD: &str = "name";
pub const CORPUS_FIELD: &str = "source_type";

/// Changelist id older clients send when no changelist is involved.
pub const LEGACY_NO_CHANGELIST: &str = "0";

const PRIMARY_SCOPE_KEY: &str = "primary";
const CHANGELIST_SCOPE_PREFIX: &str = "cl/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd, Default)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    #[default]
    Untriaged,
    Positive,
    Negative,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untriaged => "untriaged",
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "untriaged" => Ok(Self::Untriaged),
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            other => Err(format!(
                "invalid label '{other}', expected one of: positive, negative, untriaged"
            )),
        }
    }
}

/// What a bulk triage payload asks for one digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelChoice {
    Set(Label),
    /// `null`, a missing value or `""`: keep the current label.
    Unchanged,
}

impl LabelChoice {
    pub fn from_wire(value: Option<&str>) -> Result<Self, String> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Unchanged),
            Some(label) => label.parse().map(Self::Set),
        }
    }

    pub fn label(self) -> Option<Label> {
        match self {
            Self::Set(label) => Some(label),
            Self::Unchanged => None,
        }
    }
}

/// Which expectations a read or a triage applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Primary,
    Changelist { id: String, crs: String },
}

impl Scope {
    pub fn changelist(id: impl Into<String>, crs: impl Into<String>) -> Self {
        Self::Changelist {
            id: id.into(),
            crs: crs.into(),
        }
    }

    /// Resolves the scope named by a request. Both a changelist id and a code
    /// review system are needed for a changelist scope; `""` and `"0"` mean none.
    pub fn from_request(issue: Option<&str>, crs: Option<&str>) -> Self {
        let id = normalize_optional(issue).filter(|id| id != LEGACY_NO_CHANGELIST);
        let crs = normalize_optional(crs);
        match (id, crs) {
            (Some(id), Some(crs)) => Self::Changelist { id, crs },
            _ => Self::Primary,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }

    /// Storage key: `primary` or `cl/<crs>/<id>`, with `%` and `/` in the
    /// code review system percent-escaped so the first `/` separates it.
    pub fn key(&self) -> String {
        match self {
            Self::Primary => PRIMARY_SCOPE_KEY.to_owned(),
            Self::Changelist { id, crs } => {
                format!("{CHANGELIST_SCOPE_PREFIX}{}/{id}", escape_crs(crs))
            }
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        if key == PRIMARY_SCOPE_KEY {
            return Some(Self::Primary);
        }

        let rest = key.strip_prefix(CHANGELIST_SCOPE_PREFIX)?;
        let (crs, id) = rest.split_once('/')?;
        if crs.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::changelist(id, unescape_crs(crs)?))
    }
}

fn escape_crs(crs: &str) -> String {
    crs.replace('%', "%25").replace('/', "%2F")
}

fn unescape_crs(escaped: &str) -> Option<String> {
    let mut crs = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            crs.push(ch);
            continue;
        }
        match (chars.next(), chars.next()) {
            (Some('2'), Some('5')) => crs.push('%'),
            (Some('2'), Some('F')) => crs.push('/'),
            _ => return None,
        }
    }
    Some(crs)
}

/// Canonical structured key for a trace: `,k1=v1,k2=v2,` over sorted keys.
pub fn trace_id(params: &Params) -> TraceId {
    let mut key = String::from(",");
    for (name, value) in params {
        key.push_str(name);
        key.push('=');
        key.push_str(value);
        key.push(',');
    }
    key
}

fn normalize_optional(input: Option<&str>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
