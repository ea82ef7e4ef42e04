//! Topic authorization.
//!
//! Fan-out asks an `Authorizer` for the access level of each subscriber's
//! cached identity; only `Denied` suppresses delivery.

use rtd_core::{AccessType, Identity};
use serde::Deserialize;
use std::collections::HashMap;

/// Resolves the access a user holds on a topic.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, topic: &str, identity: &Identity) -> AccessType;
}

/// Grants write access on every topic.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _topic: &str, _identity: &Identity) -> AccessType {
        AccessType::Write
    }
}

/// One `[[acl.rules]]` entry. `user = "*"` matches every user on the topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AclRule {
    pub topic: String,
    pub user: String,
    pub access: AccessType,
}

/// Static per-topic access table.
///
/// Lookup order: exact (topic, user id), then (topic, "*"), then the default.
#[derive(Debug, Clone)]
pub struct TopicAcl {
    rules: HashMap<(String, String), AccessType>,
    default: AccessType,
}

impl TopicAcl {
    pub fn new(default: AccessType) -> Self {
        Self {
            rules: HashMap::new(),
            default,
        }
    }

    pub fn from_rules(rules: &[AclRule], default: AccessType) -> Self {
        let mut acl = Self::new(default);
        for rule in rules {
            acl.set(&rule.topic, &rule.user, rule.access);
        }
        acl
    }

    pub fn set(&mut self, topic: &str, user: &str, access: AccessType) {
        self.rules
            .insert((topic.to_string(), user.to_string()), access);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Authorizer for TopicAcl {
    fn authorize(&self, topic: &str, identity: &Identity) -> AccessType {
        self.rules
            .get(&(topic.to_string(), identity.id.clone()))
            .or_else(|| self.rules.get(&(topic.to_string(), "*".to_string())))
            .copied()
            .unwrap_or(self.default)
    }
}
