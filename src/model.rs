use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    System,
    Services,
    Resources,
    Logs,
    Users,
    Sessions,
}

impl Domain {
    pub const ALL: [Domain; 6] = [
        Domain::System,
        Domain::Services,
        Domain::Resources,
        Domain::Logs,
        Domain::Users,
        Domain::Sessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::System => "system",
            Domain::Services => "services",
            Domain::Resources => "resources",
            Domain::Logs => "logs",
            Domain::Users => "users",
            Domain::Sessions => "sessions",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown domain '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Active,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Enabled,
    Disabled,
    Restricted,
}

/// Closed state sets a snapshot field may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum EnumValue {
    Lifecycle(LifecycleState),
    Managed(ManagedStatus),
    Account(AccountStatus),
    Level(LogLevel),
    Toggle(Toggle),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Enum(EnumValue),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<EnumValue> {
        match self {
            FieldValue::Enum(v) => Some(*v),
            _ => None,
        }
    }
}

/// One timestamped capture of a domain. Fields cannot be changed after
/// construction; build a new snapshot instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    domain: Domain,
    captured_at: i64,
    fields: BTreeMap<String, FieldValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl Snapshot {
    pub fn new(
        domain: Domain,
        captured_at: i64,
        fields: BTreeMap<String, FieldValue>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            domain,
            captured_at,
            fields,
            warnings,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(FieldValue::as_number)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub name: String,
    pub state: LifecycleState,
    pub status: ManagedStatus,
    pub uptime_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub service: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub username: String,
    pub uid: u32,
    pub groups: Vec<String>,
    pub last_login: Option<i64>,
    pub status: AccountStatus,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub username: String,
    pub tty: String,
    pub origin: Option<String>,
    pub login_time: i64,
    pub idle_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub verdict: Verdict,
    pub evidence: String,
    pub evaluated_at: i64,
}

/// Entity rows produced alongside a snapshot for table-backed domains.
#[derive(Debug, Clone, PartialEq)]
pub enum Entities {
    None,
    Services(Vec<Service>),
    Logs(Vec<LogEntry>),
    Users(Vec<User>),
    Sessions(Vec<Session>),
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_parses_from_its_name() {
        for d in Domain::ALL {
            assert_eq!(d.as_str().parse::<Domain>().unwrap(), d);
        }
        assert!("disks".parse::<Domain>().is_err());
    }

    #[test]
    fn field_values_serialize_untagged() {
        let mut fields = BTreeMap::new();
        fields.insert("cpu.usage_percent".to_string(), FieldValue::Number(12.5));
        fields.insert(
            "security.ssh_root_login".to_string(),
            FieldValue::Enum(EnumValue::Toggle(Toggle::Disabled)),
        );
        let snap = Snapshot::new(Domain::System, 10, fields, Vec::new());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["domain"], "system");
        assert_eq!(json["fields"]["cpu.usage_percent"], 12.5);
        assert_eq!(
            json["fields"]["security.ssh_root_login"]["value"],
            "disabled"
        );
        assert!(json.get("warnings").is_none());
    }
}
