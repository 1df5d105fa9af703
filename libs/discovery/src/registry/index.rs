//! Secondary indices (tag, version, environment → node names)

use std::collections::{HashMap, HashSet};

use crate::model::Node;

/// Attribute filter applied to a discovery request
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeFilter {
    /// All listed tags must be present
    pub tags: Vec<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
}

impl NodeFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.version.is_none() && self.environment.is_none()
    }

    pub fn matches(&self, node: &Node) -> bool {
        node.has_all_tags(&self.tags)
            && self
                .version
                .as_ref()
                .map_or(true, |v| node.version.as_ref() == Some(v))
            && self
                .environment
                .as_ref()
                .map_or(true, |e| node.environment.as_ref() == Some(e))
    }
}

#[derive(Debug, Default)]
pub struct ServiceIndex {
    by_tag: HashMap<String, HashSet<String>>,
    by_version: HashMap<String, HashSet<String>>,
    by_environment: HashMap<String, HashSet<String>>,
}

fn add(map: &mut HashMap<String, HashSet<String>>, key: &str, node: &str) {
    map.entry(key.to_string()).or_default().insert(node.to_string());
}

fn drop_member(map: &mut HashMap<String, HashSet<String>>, key: &str, node: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(node);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl ServiceIndex {
    pub fn insert(&mut self, node: &Node) {
        for tag in &node.tags {
            add(&mut self.by_tag, tag, &node.name);
        }
        if let Some(version) = &node.version {
            add(&mut self.by_version, version, &node.name);
        }
        if let Some(environment) = &node.environment {
            add(&mut self.by_environment, environment, &node.name);
        }
    }

    pub fn remove(&mut self, node: &Node) {
        for tag in &node.tags {
            drop_member(&mut self.by_tag, tag, &node.name);
        }
        if let Some(version) = &node.version {
            drop_member(&mut self.by_version, version, &node.name);
        }
        if let Some(environment) = &node.environment {
            drop_member(&mut self.by_environment, environment, &node.name);
        }
    }

    pub fn with_tag(&self, tag: &str) -> impl Iterator<Item = &str> {
        self.by_tag.get(tag).into_iter().flatten().map(String::as_str)
    }

    /// Node names satisfying every criterion of a non-empty filter
    ///
    /// Intersects from the smallest contributing set.
    pub fn lookup(&self, filter: &NodeFilter) -> HashSet<&str> {
        let mut wanted: Vec<Option<&HashSet<String>>> = Vec::new();
        for tag in &filter.tags {
            wanted.push(self.by_tag.get(tag));
        }
        if let Some(version) = &filter.version {
            wanted.push(self.by_version.get(version));
        }
        if let Some(environment) = &filter.environment {
            wanted.push(self.by_environment.get(environment));
        }

        // An unknown key empties the intersection
        let Some(mut sets) = wanted.into_iter().collect::<Option<Vec<_>>>() else {
            return HashSet::new();
        };
        sets.sort_by_key(|s| s.len());
        let Some((&first, rest)) = sets.split_first() else {
            return HashSet::new();
        };
        first
            .iter()
            .filter(|name| rest.iter().all(|s| s.contains(*name)))
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty() && self.by_version.is_empty() && self.by_environment.is_empty()
    }
}
