use super::audit::{find_services, pass_max_days, root_login, toggle_field};
use super::{not_collected, Outcome, Registry};
use crate::config::RulesConfig;
use crate::model::{LifecycleState, Toggle};
use crate::store::StoreView;

/// `login.defs` uses this value for "never expires".
const NEVER_EXPIRES_DAYS: f64 = 99_999.0;

pub(super) fn registry(cfg: &RulesConfig) -> Registry {
    let mut r = Registry::new();

    let max_days = cfg.pass_max_days;
    r.register("Password Policy", move |view| match pass_max_days(view) {
        None => Outcome::fail(not_collected("password ageing policy")),
        Some(days) if days <= 0.0 || days >= NEVER_EXPIRES_DAYS => {
            Outcome::fail("passwords never expire")
        }
        Some(days) if days <= max_days as f64 => {
            Outcome::pass(format!("maximum password age {days} days"))
        }
        Some(days) => Outcome::warn(format!(
            "maximum password age {days} days exceeds {max_days}"
        )),
    });

    let backup = cfg.backup_services.clone();
    r.register("Backup Policy", move |view| {
        service_policy(view, &backup, "backup")
    });

    let updates = cfg.update_services.clone();
    r.register("Update Policy", move |view| {
        service_policy(view, &updates, "update")
    });

    r.register("Access Control", |view| {
        let Some(users) = view.users.as_deref() else {
            return Outcome::fail(not_collected("users"));
        };
        let extra_root: Vec<&str> = users
            .iter()
            .filter(|u| u.uid == 0 && u.username != "root")
            .map(|u| u.username.as_str())
            .collect();
        if !extra_root.is_empty() {
            return Outcome::fail(format!("uid 0 accounts: {}", extra_root.join(", ")));
        }
        match root_login(view) {
            Some(Toggle::Disabled) => Outcome::pass("No violations found"),
            Some(Toggle::Restricted) => Outcome::warn("root may log in over ssh with a key"),
            Some(Toggle::Enabled) => Outcome::fail("root may log in over ssh with a password"),
            None => Outcome::fail(not_collected("sshd configuration")),
        }
    });

    let required = cfg.encrypted_mounts.clone();
    r.register("Encryption", move |view| {
        let Some(system) = view.system.as_ref() else {
            return Outcome::fail(not_collected("system"));
        };
        let reported: Vec<&str> = system
            .fields()
            .keys()
            .filter_map(|name| name.strip_prefix("mount.")?.strip_suffix(".encrypted"))
            .collect();
        if reported.is_empty() {
            return Outcome::fail(not_collected("block devices"));
        }
        if required.is_empty() {
            return Outcome::pass("no encrypted mounts required");
        }
        let mounted: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|m| reported.contains(m))
            .collect();
        if mounted.is_empty() {
            return Outcome::warn(format!("none of {} mounted", required.join(", ")));
        }
        let plain: Vec<&str> = mounted
            .iter()
            .copied()
            .filter(|m| {
                toggle_field(system, &format!("mount.{m}.encrypted")) != Some(Toggle::Enabled)
            })
            .collect();
        if plain.is_empty() {
            Outcome::pass(format!("{} encrypted", mounted.join(", ")))
        } else {
            Outcome::fail(format!("{} not encrypted", plain.join(", ")))
        }
    });

    let (warn_at, fail_at) = (cfg.disk_warn_percent, cfg.disk_fail_percent);
    r.register("Disk Capacity", move |view| {
        let Some(resources) = view.resources.as_ref() else {
            return Outcome::fail(not_collected("resources"));
        };
        let fullest = resources
            .fields()
            .iter()
            .filter_map(|(name, value)| {
                let mount = name.strip_prefix("disk.")?.strip_suffix(".usage_percent")?;
                Some((mount, value.as_number()?))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));
        match fullest {
            None => Outcome::warn("no disks reported"),
            Some((mount, pct)) if pct >= fail_at => {
                Outcome::fail(format!("{mount} at {pct:.1}%"))
            }
            Some((mount, pct)) if pct >= warn_at => {
                Outcome::warn(format!("{mount} at {pct:.1}%"))
            }
            Some((mount, pct)) => Outcome::pass(format!("fullest mount {mount} at {pct:.1}%")),
        }
    });

    r
}

/// PASS when a configured service is active, WARN when one is installed but
/// not active, FAIL when none is installed.
fn service_policy(view: &StoreView, names: &[String], what: &str) -> Outcome {
    let Some(services) = view.services.as_deref() else {
        return Outcome::fail(not_collected("services"));
    };
    let known = find_services(services, names);
    if let Some(s) = known.iter().find(|s| s.state == LifecycleState::Active) {
        return Outcome::pass(format!("{} is active", s.name));
    }
    match known.first() {
        Some(s) => {
            let state = match s.state {
                LifecycleState::Active => "active",
                LifecycleState::Inactive => "inactive",
                LifecycleState::Failed => "failed",
            };
            Outcome::warn(format!("{what} service {} is {state}", s.name))
        }
        None => Outcome::fail(format!("no {what} service installed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AccountStatus, Domain, EnumValue, FieldValue, ManagedStatus, Service, Snapshot, User,
        Verdict,
    };
    use std::collections::BTreeMap;

    fn snapshot(domain: Domain, fields: &[(&str, FieldValue)]) -> Snapshot {
        let fields: BTreeMap<String, FieldValue> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Snapshot::new(domain, 1, fields, Vec::new())
    }

    fn user(name: &str, uid: u32) -> User {
        User {
            username: name.to_string(),
            uid,
            groups: Vec::new(),
            last_login: None,
            status: AccountStatus::Active,
            shell: "/bin/bash".to_string(),
        }
    }

    fn mount(encrypted: bool) -> FieldValue {
        let toggle = if encrypted {
            Toggle::Enabled
        } else {
            Toggle::Disabled
        };
        FieldValue::Enum(EnumValue::Toggle(toggle))
    }

    fn view(max_days: f64, disk: f64, backup: LifecycleState) -> StoreView {
        StoreView {
            now: 1,
            system: Some(snapshot(
                Domain::System,
                &[
                    ("security.pass_max_days", FieldValue::Number(max_days)),
                    (
                        "security.ssh_root_login",
                        FieldValue::Enum(EnumValue::Toggle(Toggle::Disabled)),
                    ),
                    ("mount./.encrypted", mount(false)),
                    ("mount./home.encrypted", mount(true)),
                ],
            )),
            resources: Some(snapshot(
                Domain::Resources,
                &[
                    ("disk./.usage_percent", FieldValue::Number(20.0)),
                    ("disk./data.usage_percent", FieldValue::Number(disk)),
                ],
            )),
            services: Some(vec![Service {
                name: "backup".to_string(),
                state: backup,
                status: ManagedStatus::Stopped,
                uptime_secs: None,
            }]),
            users: Some(vec![user("root", 0), user("admin", 1000)]),
        }
    }

    fn verdicts(view: &StoreView) -> Vec<Verdict> {
        registry(&RulesConfig::default())
            .evaluate(view)
            .iter()
            .map(|r| r.verdict)
            .collect()
    }

    #[test]
    fn three_level_verdicts() {
        use Verdict::*;
        assert_eq!(
            verdicts(&view(90.0, 50.0, LifecycleState::Active)),
            vec![Pass, Pass, Fail, Pass, Pass, Pass]
        );
        assert_eq!(
            verdicts(&view(120.0, 89.0, LifecycleState::Inactive)),
            vec![Warn, Warn, Fail, Pass, Pass, Warn]
        );
        assert_eq!(
            verdicts(&view(99_999.0, 97.0, LifecycleState::Inactive)),
            vec![Fail, Warn, Fail, Pass, Pass, Fail]
        );
    }

    #[test]
    fn disk_evidence_names_fullest_mount() {
        let results =
            registry(&RulesConfig::default()).evaluate(&view(90.0, 89.0, LifecycleState::Active));
        assert_eq!(results[5].evidence, "/data at 89.0%");
        assert_eq!(results[1].evidence, "backup is active");
    }

    #[test]
    fn second_uid_zero_account_fails_access_control() {
        let mut v = view(90.0, 10.0, LifecycleState::Active);
        v.users = Some(vec![user("root", 0), user("toor", 0)]);
        let results = registry(&RulesConfig::default()).evaluate(&v);
        assert_eq!(results[3].verdict, Verdict::Fail);
        assert_eq!(results[3].evidence, "uid 0 accounts: toor");
    }

    fn encryption(v: &StoreView) -> (Verdict, String) {
        let results = registry(&RulesConfig::default()).evaluate(v);
        (results[4].verdict, results[4].evidence.clone())
    }

    fn with_mounts(mounts: &[(&str, bool)]) -> StoreView {
        let fields: Vec<(String, FieldValue)> = mounts
            .iter()
            .map(|(m, enc)| (format!("mount.{m}.encrypted"), mount(*enc)))
            .collect();
        let fields: Vec<(&str, FieldValue)> =
            fields.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        StoreView {
            system: Some(snapshot(Domain::System, &fields)),
            ..view(90.0, 10.0, LifecycleState::Active)
        }
    }

    #[test]
    fn configured_mounts_must_sit_on_crypt_devices() {
        let (verdict, evidence) = encryption(&view(90.0, 10.0, LifecycleState::Active));
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(evidence, "/home encrypted");

        let (verdict, evidence) =
            encryption(&with_mounts(&[("/", true), ("/home", false), ("/data", false)]));
        assert_eq!(verdict, Verdict::Fail);
        assert_eq!(evidence, "/home, /data not encrypted");

        let (verdict, evidence) = encryption(&with_mounts(&[("/", true)]));
        assert_eq!(verdict, Verdict::Warn);
        assert_eq!(evidence, "none of /home, /data mounted");

        let (verdict, evidence) = encryption(&with_mounts(&[]));
        assert_eq!(verdict, Verdict::Fail);
        assert_eq!(evidence, "block devices not collected");
    }
}
