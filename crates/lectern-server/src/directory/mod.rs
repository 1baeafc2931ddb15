//! Class directory
//!
//! Join eligibility is decided by an external scheduling store; this server
//! only asks whether a class exists and is currently live. Deployments plug
//! their own directory in behind the trait.

use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ClassMetadata {
    pub session_id: String,
    pub title: String,
}

#[async_trait]
pub trait ClassDirectory: Send + Sync {
    async fn find_class(&self, session_id: &str) -> Option<ClassMetadata>;

    async fn is_live(&self, session_id: &str) -> bool;
}

/// Admits every class id; the default for standalone deployments
pub struct OpenDirectory;

#[async_trait]
impl ClassDirectory for OpenDirectory {
    async fn find_class(&self, session_id: &str) -> Option<ClassMetadata> {
        Some(ClassMetadata {
            session_id: session_id.to_string(),
            title: session_id.to_string(),
        })
    }

    async fn is_live(&self, _session_id: &str) -> bool {
        true
    }
}

/// Admits only a fixed set of class ids
pub struct FixedRoster {
    classes: HashSet<String>,
}

impl FixedRoster {
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ClassDirectory for FixedRoster {
    async fn find_class(&self, session_id: &str) -> Option<ClassMetadata> {
        self.classes.get(session_id).map(|id| ClassMetadata {
            session_id: id.clone(),
            title: id.clone(),
        })
    }

    async fn is_live(&self, session_id: &str) -> bool {
        self.classes.contains(session_id)
    }
}
