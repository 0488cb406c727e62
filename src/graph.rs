//! App graphs and the configuration differ.
//!
//! An app graph is the declarative description of dataplane apps and the
//! links between their ports, produced by the user-supplied setup function
//! as a pure function of configuration. The differ turns an (old, new) pair
//! into the ordered action stream that reconstructs the new graph at a
//! follower.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::action::Action;

/// One app instance: which engine module runs it and its printed argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub kind: String,
    pub arg: String,
}

/// A directed link between two app ports, `"app.port"` on each end.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkSpec {
    pub from: String,
    pub to: String,
}

impl LinkSpec {
    pub fn new(from: &str, to: &str) -> Self {
        LinkSpec {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// App name on the transmitting end.
    pub fn from_app(&self) -> &str {
        endpoint_app(&self.from)
    }

    /// App name on the receiving end.
    pub fn to_app(&self) -> &str {
        endpoint_app(&self.to)
    }
}

fn endpoint_app(endpoint: &str) -> &str {
    endpoint.split('.').next().unwrap_or(endpoint)
}

/// The declarative dataplane graph. Equality is structural; equal graphs
/// diff to an empty action stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppGraph {
    pub apps: BTreeMap<String, AppSpec>,
    pub links: BTreeSet<LinkSpec>,
}

impl AppGraph {
    pub fn new() -> Self {
        AppGraph::default()
    }

    pub fn add_app(&mut self, name: &str, kind: &str, arg: &str) {
        self.apps.insert(
            name.to_string(),
            AppSpec {
                kind: kind.to_string(),
                arg: arg.to_string(),
            },
        );
    }

    pub fn add_link(&mut self, from: &str, to: &str) {
        self.links.insert(LinkSpec::new(from, to));
    }
}

/// Diff two graphs into the ordered action stream.
///
/// Order: unlink, remove apps, add apps, reconfigure apps, link. An app
/// whose kind changed is removed and re-added, and every link touching it
/// is re-established around the swap. The maps are ordered, so the stream
/// is deterministic for a given pair of graphs.
pub fn compute_config_actions(old: &AppGraph, new: &AppGraph) -> Vec<Action> {
    let mut removed_apps: BTreeSet<&str> = BTreeSet::new();
    let mut added_apps: BTreeSet<&str> = BTreeSet::new();
    let mut reconfigured: Vec<(&str, &AppSpec)> = Vec::new();

    for (name, spec) in &old.apps {
        match new.apps.get(name) {
            None => {
                removed_apps.insert(name.as_str());
            }
            Some(new_spec) if new_spec.kind != spec.kind => {
                removed_apps.insert(name.as_str());
                added_apps.insert(name.as_str());
            }
            Some(new_spec) if new_spec.arg != spec.arg => {
                reconfigured.push((name.as_str(), new_spec));
            }
            Some(_) => {}
        }
    }
    for name in new.apps.keys() {
        if !old.apps.contains_key(name) {
            added_apps.insert(name.as_str());
        }
    }

    let touches_swapped = |link: &LinkSpec| {
        removed_apps.contains(link.from_app()) || removed_apps.contains(link.to_app())
    };

    let mut actions = Vec::new();
    for link in &old.links {
        if !new.links.contains(link) || touches_swapped(link) {
            actions.push(Action::Unlink {
                from: link.from.clone(),
                to: link.to.clone(),
            });
        }
    }
    for name in &removed_apps {
        actions.push(Action::RemoveApp {
            name: (*name).to_string(),
        });
    }
    for name in &added_apps {
        let spec = &new.apps[*name];
        actions.push(Action::AddApp {
            name: (*name).to_string(),
            kind: spec.kind.clone(),
            arg: spec.arg.clone(),
        });
    }
    for (name, spec) in reconfigured {
        actions.push(Action::ReconfigApp {
            name: name.to_string(),
            arg: spec.arg.clone(),
        });
    }
    for link in &new.links {
        if !old.links.contains(link) || touches_swapped(link) {
            actions.push(Action::Link {
                from: link.from.clone(),
                to: link.to.clone(),
            });
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(apps: &[(&str, &str, &str)], links: &[(&str, &str)]) -> AppGraph {
        let mut g = AppGraph::new();
        for (name, kind, arg) in apps {
            g.add_app(name, kind, arg);
        }
        for (from, to) in links {
            g.add_link(from, to);
        }
        g
    }

    #[test]
    fn equal_graphs_diff_to_nothing() {
        let g = graph(&[("nic", "Intel", "{}")], &[("nic.tx", "fw.rx")]);
        assert!(compute_config_actions(&g, &g.clone()).is_empty());
    }

    #[test]
    fn add_and_link_ordering() {
        let old = graph(&[("nic", "Intel", "{}")], &[]);
        let new = graph(
            &[("nic", "Intel", "{}"), ("fw", "Firewall", "{}")],
            &[("nic.tx", "fw.rx")],
        );
        let actions = compute_config_actions(&old, &new);
        assert_eq!(
            actions,
            vec![
                Action::AddApp {
                    name: "fw".into(),
                    kind: "Firewall".into(),
                    arg: "{}".into(),
                },
                Action::Link {
                    from: "nic.tx".into(),
                    to: "fw.rx".into(),
                },
            ]
        );
    }

    #[test]
    fn removal_unlinks_first() {
        let old = graph(
            &[("nic", "Intel", "{}"), ("fw", "Firewall", "{}")],
            &[("nic.tx", "fw.rx")],
        );
        let new = graph(&[("nic", "Intel", "{}")], &[]);
        let actions = compute_config_actions(&old, &new);
        assert_eq!(
            actions,
            vec![
                Action::Unlink {
                    from: "nic.tx".into(),
                    to: "fw.rx".into(),
                },
                Action::RemoveApp { name: "fw".into() },
            ]
        );
    }

    #[test]
    fn arg_change_reconfigures() {
        let old = graph(&[("fw", "Firewall", "{\"ttl\":1}")], &[]);
        let new = graph(&[("fw", "Firewall", "{\"ttl\":2}")], &[]);
        let actions = compute_config_actions(&old, &new);
        assert_eq!(
            actions,
            vec![Action::ReconfigApp {
                name: "fw".into(),
                arg: "{\"ttl\":2}".into(),
            }]
        );
    }

    #[test]
    fn kind_change_swaps_app_and_relinks() {
        let old = graph(
            &[("nic", "Intel", "{}"), ("fw", "Firewall", "{}")],
            &[("nic.tx", "fw.rx")],
        );
        let new = graph(
            &[("nic", "Intel", "{}"), ("fw", "StatefulFirewall", "{}")],
            &[("nic.tx", "fw.rx")],
        );
        let actions = compute_config_actions(&old, &new);
        assert_eq!(
            actions,
            vec![
                Action::Unlink {
                    from: "nic.tx".into(),
                    to: "fw.rx".into(),
                },
                Action::RemoveApp { name: "fw".into() },
                Action::AddApp {
                    name: "fw".into(),
                    kind: "StatefulFirewall".into(),
                    arg: "{}".into(),
                },
                Action::Link {
                    from: "nic.tx".into(),
                    to: "fw.rx".into(),
                },
            ]
        );
    }
}
