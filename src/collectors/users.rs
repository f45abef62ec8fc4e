use crate::collectors::{
    run_command, CollectionError, Collector, RawPayload, RawSample, RawSession, RawUser,
};
use crate::model::{now_unix, Domain};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

const PASSWD_PATH: &str = "/etc/passwd";
const GROUP_PATH: &str = "/etc/group";
const NOBODY_UID: u32 = 65534;

/// Local accounts: root-equivalent accounts plus every uid at or above
/// `min_uid`, with group membership and last login from wtmp.
pub struct AccountCollector {
    min_uid: u32,
}

impl AccountCollector {
    pub fn new(min_uid: u32) -> Self {
        Self { min_uid }
    }
}

#[async_trait]
impl Collector for AccountCollector {
    fn domain(&self) -> Domain {
        Domain::Users
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        let passwd = tokio::fs::read_to_string(PASSWD_PATH)
            .await
            .map_err(|err| {
                CollectionError::unavailable(Domain::Users, format!("{PASSWD_PATH}: {err}"))
            })?;
        let group = tokio::fs::read_to_string(GROUP_PATH)
            .await
            .map_err(|err| {
                CollectionError::unavailable(Domain::Users, format!("{GROUP_PATH}: {err}"))
            })?;

        let accounts = parse_passwd(&passwd)
            .map_err(|detail| CollectionError::malformed(Domain::Users, detail))?;
        let groups = parse_groups(&group);

        let last = run_command(Domain::Users, "last", &["--time-format", "iso", "-w"]).await;
        let last_logins = match last {
            Ok(text) => parse_last(&text),
            Err(err) => {
                warn!(error = %err, "last unavailable, last-login times omitted");
                HashMap::new()
            }
        };

        let users: Vec<RawUser> = accounts
            .into_iter()
            .filter(|a| a.uid == 0 || (a.uid >= self.min_uid && a.uid != NOBODY_UID))
            .map(|a| RawUser {
                groups: groups.memberships(&a.name, a.gid),
                last_login: last_logins.get(&a.name).copied(),
                name: a.name,
                uid: a.uid,
                shell: a.shell,
            })
            .collect();
        debug!(users = users.len(), "collected local accounts");

        Ok(RawSample {
            domain: Domain::Users,
            captured_at: now_unix(),
            payload: RawPayload::Users(users),
        })
    }
}

/// Logged-in sessions as reported by `who -u`.
pub struct SessionCollector;

impl SessionCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collector for SessionCollector {
    fn domain(&self) -> Domain {
        Domain::Sessions
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        let text = run_command(Domain::Sessions, "who", &["-u"]).await?;
        let sessions = parse_who(&text, Local::now().year())
            .map_err(|detail| CollectionError::malformed(Domain::Sessions, detail))?;

        Ok(RawSample {
            domain: Domain::Sessions,
            captured_at: now_unix(),
            payload: RawPayload::Sessions(sessions),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Account {
    name: String,
    uid: u32,
    gid: u32,
    shell: String,
}

fn parse_passwd(text: &str) -> Result<Vec<Account>, String> {
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        // NIS compat entries (`+`, `+user`, `-@netgroup`) name no local account.
        if line.starts_with('+') || line.starts_with('-') {
            continue;
        }
        let cols: Vec<&str> = line.split(':').collect();
        if cols.len() < 7 {
            return Err(format!("passwd line has {} columns: '{line}'", cols.len()));
        }
        let uid = cols[2]
            .parse::<u32>()
            .map_err(|_| format!("passwd uid '{}' for {}", cols[2], cols[0]))?;
        let gid = cols[3]
            .parse::<u32>()
            .map_err(|_| format!("passwd gid '{}' for {}", cols[3], cols[0]))?;
        out.push(Account {
            name: cols[0].to_string(),
            uid,
            gid,
            shell: cols[6].to_string(),
        });
    }
    Ok(out)
}

#[derive(Debug, Default)]
struct GroupTable {
    by_gid: HashMap<u32, String>,
    members: HashMap<String, Vec<String>>,
}

impl GroupTable {
    fn memberships(&self, user: &str, primary_gid: u32) -> Vec<String> {
        let mut out = BTreeSet::new();
        if let Some(name) = self.by_gid.get(&primary_gid) {
            out.insert(name.clone());
        }
        if let Some(groups) = self.members.get(user) {
            out.extend(groups.iter().cloned());
        }
        out.into_iter().collect()
    }
}

fn parse_groups(text: &str) -> GroupTable {
    let mut table = GroupTable::default();
    for line in text.lines() {
        let cols: Vec<&str> = line.split(':').collect();
        if cols.len() < 4 {
            continue;
        }
        let Ok(gid) = cols[2].parse::<u32>() else {
            continue;
        };
        table.by_gid.insert(gid, cols[0].to_string());
        for member in cols[3].split(',').map(str::trim).filter(|m| !m.is_empty()) {
            table
                .members
                .entry(member.to_string())
                .or_default()
                .push(cols[0].to_string());
        }
    }
    table
}

/// `last` lists newest first, so the first timestamp seen per user wins.
fn parse_last(text: &str) -> HashMap<String, i64> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(user) = parts.next() else {
            continue;
        };
        if user == "reboot" || user == "shutdown" || user == "wtmp" {
            continue;
        }
        let login = parts.find_map(|p| DateTime::parse_from_rfc3339(p).ok());
        if let Some(at) = login {
            out.entry(user.to_string()).or_insert(at.timestamp());
        }
    }
    out
}

/// Accepts both `who` time layouts: `2024-12-14 08:30` and `Dec 14 08:30`.
fn parse_who(text: &str, current_year: i32) -> Result<Vec<RawSession>, String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 5 {
            return Err(format!("unexpected who line: '{line}'"));
        }
        let (login, rest) = if parts[2].contains('-') {
            let stamp = format!("{} {}", parts[2], parts[3]);
            let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M")
                .map_err(|err| format!("who time '{stamp}': {err}"))?;
            (naive, &parts[4..])
        } else {
            if parts.len() < 6 {
                return Err(format!("unexpected who line: '{line}'"));
            }
            let stamp = format!("{current_year} {} {} {}", parts[2], parts[3], parts[4]);
            let naive = NaiveDateTime::parse_from_str(&stamp, "%Y %b %d %H:%M")
                .map_err(|err| format!("who time '{stamp}': {err}"))?;
            (naive, &parts[5..])
        };

        let login_time = Local
            .from_local_datetime(&login)
            .earliest()
            .map(|dt| dt.timestamp())
            .unwrap_or_else(|| Utc.from_utc_datetime(&login).timestamp());
        let idle = rest.first().copied().unwrap_or("?").to_string();
        let origin = rest
            .iter()
            .find(|p| p.starts_with('(') && p.ends_with(')'))
            .map(|p| p.trim_start_matches('(').trim_end_matches(')').to_string())
            .filter(|o| !o.is_empty());

        out.push(RawSession {
            user: parts[0].to_string(),
            tty: parts[1].to_string(),
            origin,
            login_time,
            idle,
        });
    }
    Ok(out)
}
