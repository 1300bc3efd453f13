//! Structural comparison of two configurations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::{AppSpec, Config, TransportOptions};

/// What a reload has to rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    /// The app's listener has to be rebuilt.
    pub server_changed: bool,
    /// Services whose set of serving apps changed.
    pub affected_services: BTreeSet<String>,
}

impl ConfigDiff {
    /// Nothing to rebuild.
    pub fn is_empty(&self) -> bool {
        !self.server_changed && self.affected_services.is_empty()
    }
}

/// Group apps by the services they provide, in config order.
///
/// Apps with `serve: false` are included: they are hosted elsewhere but
/// still reachable at their uri.
pub fn group_by_service(config: &Config) -> BTreeMap<String, Vec<AppSpec>> {
    let mut groups: BTreeMap<String, Vec<AppSpec>> = BTreeMap::new();
    for app in &config.apps {
        for service in &app.services {
            groups.entry(service.clone()).or_default().push(app.clone());
        }
    }
    groups
}

/// Compare two configurations from the point of view of `app_name`.
pub fn diff(old: &Config, new: &Config, app_name: Option<&str>) -> ConfigDiff {
    let server_changed = match app_name {
        Some(name) => server_changed(
            old.apps.iter().find(|app| app.name == name),
            new.apps.iter().find(|app| app.name == name),
        ),
        None => false,
    };

    let old_groups = group_by_service(old);
    let new_groups = group_by_service(new);

    let affected_services = old_groups
        .keys()
        .chain(new_groups.keys())
        .filter(|service| match (old_groups.get(*service), new_groups.get(*service)) {
            (Some(before), Some(after)) => !same_providers(before, after),
            _ => true,
        })
        .cloned()
        .collect();

    ConfigDiff {
        server_changed,
        affected_services,
    }
}

/// Whether two provider lists reach the same endpoints the same way.
///
/// Only the fields a client connection depends on are compared, so an app
/// that merely starts serving another service does not count as a change.
pub fn same_providers(before: &[AppSpec], after: &[AppSpec]) -> bool {
    endpoints(before) == endpoints(after)
}

/// Whether the listener must be rebuilt. Served services are re-registered on
/// every reload and do not count.
fn server_changed(old: Option<&AppSpec>, new: Option<&AppSpec>) -> bool {
    let (Some(old), Some(new)) = (old, new) else {
        return true;
    };
    old.uri != new.uri
        || old.cert != new.cert
        || old.key != new.key
        || old.transport_options() != new.transport_options()
}

/// The parts of an app a client connection depends on.
#[derive(Debug, PartialEq)]
struct Endpoint<'a> {
    name: &'a str,
    uri: &'a str,
    cert: Option<&'a PathBuf>,
    key: Option<&'a PathBuf>,
    connect_timeout: Option<u64>,
    options: TransportOptions,
}

fn endpoints(apps: &[AppSpec]) -> Vec<Endpoint<'_>> {
    apps.iter()
        .map(|app| Endpoint {
            name: &app.name,
            uri: &app.uri,
            cert: app.cert.as_ref(),
            key: app.key.as_ref(),
            connect_timeout: app.connect_timeout,
            options: app.transport_options(),
        })
        .collect()
}
