use super::{not_collected, Outcome, Registry};
use crate::config::RulesConfig;
use crate::model::{EnumValue, LifecycleState, Service, Snapshot, Toggle};
use crate::store::StoreView;

pub(super) fn registry(cfg: &RulesConfig) -> Registry {
    let mut r = Registry::new();

    r.register("SSH root login disabled", |view| {
        match root_login(view) {
            Some(Toggle::Disabled) => Outcome::pass("PermitRootLogin no"),
            Some(Toggle::Restricted) => Outcome::fail("PermitRootLogin allows key-based root login"),
            Some(Toggle::Enabled) => Outcome::fail("PermitRootLogin yes"),
            None => Outcome::fail(not_collected("sshd configuration")),
        }
    });

    let firewall = cfg.firewall_services.clone();
    r.register("Firewall enabled", move |view| {
        any_active(view, &firewall, "firewall service")
    });

    let updates = cfg.update_services.clone();
    r.register("Automatic updates configured", move |view| {
        any_active(view, &updates, "automatic update service")
    });

    let max_days = cfg.pass_max_days;
    r.register("Password policy enforced", move |view| {
        match pass_max_days(view) {
            Some(days) if days > 0.0 && days <= max_days as f64 => {
                Outcome::pass(format!("PASS_MAX_DAYS {days} (limit {max_days})"))
            }
            Some(days) => Outcome::fail(format!("PASS_MAX_DAYS {days} exceeds {max_days}")),
            None => Outcome::fail(not_collected("password ageing policy")),
        }
    });

    let unnecessary = cfg.unnecessary_services.clone();
    r.register("Unnecessary services disabled", move |view| {
        let Some(services) = view.services.as_deref() else {
            return Outcome::fail(not_collected("services"));
        };
        let running: Vec<&str> = services
            .iter()
            .filter(|s| s.state == LifecycleState::Active && unnecessary.contains(&s.name))
            .map(|s| s.name.as_str())
            .collect();
        if running.is_empty() {
            Outcome::pass("no unnecessary services active")
        } else {
            Outcome::fail(format!("active: {}", running.join(", ")))
        }
    });

    let min_days = cfg.cert_min_days;
    r.register("SSL certificates valid", move |view| {
        let Some(system) = view.system.as_ref() else {
            return Outcome::fail(not_collected("system"));
        };
        let mut checked = 0;
        let mut problems = Vec::new();
        for (name, value) in system.fields() {
            let Some(rest) = name.strip_prefix("cert.") else {
                continue;
            };
            if let Some(path) = rest.strip_suffix(".days_left") {
                checked += 1;
                match value.as_number() {
                    Some(days) if days < 0.0 => problems.push(format!("{path} expired")),
                    Some(days) if days < min_days as f64 => {
                        problems.push(format!("{path} expires in {days} days"))
                    }
                    Some(_) => {}
                    None => problems.push(format!("{path} unreadable")),
                }
            } else if let Some(path) = rest.strip_suffix(".error") {
                checked += 1;
                problems.push(format!("{path}: {}", value.as_text().unwrap_or("unreadable")));
            }
        }
        if !problems.is_empty() {
            Outcome::fail(problems.join("; "))
        } else if checked == 0 {
            Outcome::pass("no certificates configured")
        } else {
            Outcome::pass(format!(
                "{checked} certificate(s) valid for at least {min_days} days"
            ))
        }
    });

    r.register("File permissions secure", |view| {
        let Some(system) = view.system.as_ref() else {
            return Outcome::fail(not_collected("system"));
        };
        let (Some(shadow), Some(passwd)) = (
            system.number("security.shadow_mode"),
            system.number("security.passwd_mode"),
        ) else {
            return Outcome::fail(not_collected("file modes"));
        };
        let (shadow, passwd) = (shadow as u32, passwd as u32);
        let mut problems = Vec::new();
        if shadow & 0o027 != 0 {
            problems.push(format!("/etc/shadow is {shadow:o}"));
        }
        if passwd & 0o022 != 0 {
            problems.push(format!("/etc/passwd is {passwd:o}"));
        }
        if problems.is_empty() {
            Outcome::pass(format!("/etc/shadow {shadow:o}, /etc/passwd {passwd:o}"))
        } else {
            Outcome::fail(problems.join("; "))
        }
    });

    r.register("No failed services", |view| {
        let Some(services) = view.services.as_deref() else {
            return Outcome::fail(not_collected("services"));
        };
        let failed: Vec<&str> = services
            .iter()
            .filter(|s| s.state == LifecycleState::Failed)
            .map(|s| s.name.as_str())
            .collect();
        if failed.is_empty() {
            Outcome::pass(format!("{} services, none failed", services.len()))
        } else {
            Outcome::fail(format!("failed: {}", failed.join(", ")))
        }
    });

    r
}

pub(super) fn toggle_field(snapshot: &Snapshot, name: &str) -> Option<Toggle> {
    match snapshot.field(name)?.as_enum()? {
        EnumValue::Toggle(t) => Some(t),
        _ => None,
    }
}

pub(super) fn root_login(view: &StoreView) -> Option<Toggle> {
    toggle_field(view.system.as_ref()?, "security.ssh_root_login")
}

pub(super) fn pass_max_days(view: &StoreView) -> Option<f64> {
    view.system.as_ref()?.number("security.pass_max_days")
}

pub(super) fn find_services<'a>(services: &'a [Service], names: &[String]) -> Vec<&'a Service> {
    services.iter().filter(|s| names.contains(&s.name)).collect()
}

fn any_active(view: &StoreView, names: &[String], what: &str) -> Outcome {
    let Some(services) = view.services.as_deref() else {
        return Outcome::fail(not_collected("services"));
    };
    let known = find_services(services, names);
    match known.iter().find(|s| s.state == LifecycleState::Active) {
        Some(s) => Outcome::pass(format!("{} is active", s.name)),
        None if known.is_empty() => Outcome::fail(format!("no {what} installed")),
        None => {
            let listed: Vec<&str> = known.iter().map(|s| s.name.as_str()).collect();
            Outcome::fail(format!("{} not active", listed.join(", ")))
        }
    }
}
