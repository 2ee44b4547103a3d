//! Merge rules for a service declared in more than one compose document.
//!
//! Scalars take the later value only when it is set, lists are unioned in
//! order without duplicates, maps merge key-wise with later values winning,
//! and compound fields (health check, command, entrypoint) are replaced
//! wholesale when the later document declares them.

use crate::compose::{ComposeServiceSpec, Dependency};
use std::collections::HashSet;

/// Merge `overlay` on top of `base`. Both must describe the same service name;
/// the base name is kept.
pub fn merge_service(base: ComposeServiceSpec, overlay: ComposeServiceSpec) -> ComposeServiceSpec {
    let mut merged = base;

    merge_scalar(&mut merged.container_name, overlay.container_name);
    merge_scalar(&mut merged.image, overlay.image);
    merge_scalar(&mut merged.restart, overlay.restart);
    merge_scalar(&mut merged.hostname, overlay.hostname);
    merge_scalar(&mut merged.user, overlay.user);

    merged.depends_on = merge_dependencies(merged.depends_on, overlay.depends_on);
    merged.ports = union_ordered(merged.ports, overlay.ports);
    merged.environment = union_ordered(merged.environment, overlay.environment);
    merged.volumes = union_ordered(merged.volumes, overlay.volumes);
    merged.networks = union_ordered(merged.networks, overlay.networks);
    merged.env_file = union_ordered(merged.env_file, overlay.env_file);
    merged.cap_add = union_ordered(merged.cap_add, overlay.cap_add);

    merged.labels.extend(overlay.labels);

    if overlay.healthcheck.is_some() {
        merged.healthcheck = overlay.healthcheck;
    }
    if overlay.command.is_some() {
        merged.command = overlay.command;
    }
    if overlay.entrypoint.is_some() {
        merged.entrypoint = overlay.entrypoint;
    }

    merged
}

fn merge_scalar(target: &mut Option<String>, later: Option<String>) {
    if let Some(value) = later.filter(|v| !v.trim().is_empty()) {
        *target = Some(value);
    }
}

/// Union of two lists keeping first-seen order.
pub(crate) fn union_ordered(base: Vec<String>, later: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(base.len() + later.len());
    base.into_iter()
        .chain(later)
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// `depends_on` is a map keyed by target: new targets append, repeated
/// targets take the later condition.
fn merge_dependencies(base: Vec<Dependency>, later: Vec<Dependency>) -> Vec<Dependency> {
    let mut merged = base;
    for dep in later {
        match merged.iter_mut().find(|d| d.service == dep.service) {
            Some(existing) => existing.condition = dep.condition,
            None => merged.push(dep),
        }
    }
    merged
}
