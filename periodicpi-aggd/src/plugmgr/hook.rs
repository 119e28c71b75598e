use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use super::{Kwargs, ManagerError, ManagerResult};

pub type HookPredicate = Arc<dyn Fn(&Kwargs) -> bool + Send + Sync>;

/// What the manager does when a handler's predicate matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Only the predicate's own side effects
    NoAction,
    /// Load the named descriptor with the event kwargs
    LoadModule(String),
    /// Unload the named instance
    UnloadModule(String),
}

#[derive(Clone)]
pub struct HookHandler {
    pub(crate) predicate: HookPredicate,
    pub(crate) action: HookAction,
    /// Instance that attached the handler; detached when it unloads
    pub(crate) owner: Option<String>,
}

impl HookHandler {
    pub fn new(predicate: HookPredicate, action: HookAction, owner: Option<String>) -> Self {
        Self {
            predicate,
            action,
            owner,
        }
    }

    pub fn matches(&self, kwargs: &Kwargs) -> bool {
        (self.predicate)(kwargs)
    }

    pub fn action(&self) -> &HookAction {
        &self.action
    }
}

impl fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandler")
            .field("action", &self.action)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Handler lists keyed by hook name.
///
/// Lists are copy-on-write: a dispatch holds its own `Arc` to the list as it
/// was when the trigger started, so attaching or detaching during dispatch
/// only shows up on the next trigger.
#[derive(Default)]
pub(crate) struct HookTable {
    hooks: HashMap<String, Arc<Vec<HookHandler>>>,
}

impl HookTable {
    /// Declare a hook. Returns false if it already existed.
    pub fn install(&mut self, name: &str) -> bool {
        if self.hooks.contains_key(name) {
            return false;
        }
        self.hooks.insert(name.to_string(), Arc::new(Vec::new()));
        true
    }

    pub fn attach(&mut self, name: &str, handler: HookHandler) -> ManagerResult<()> {
        let handlers = self
            .hooks
            .get_mut(name)
            .ok_or_else(|| ManagerError::HookNotAvailable(name.to_string()))?;
        Arc::make_mut(handlers).push(handler);
        Ok(())
    }

    pub fn snapshot(&self, name: &str) -> ManagerResult<Arc<Vec<HookHandler>>> {
        self.hooks
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::HookNotAvailable(name.to_string()))
    }

    /// Remove every handler attached by `owner`, returning how many went away
    pub fn detach_owner(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        for handlers in self.hooks.values_mut() {
            if !handlers.iter().any(|h| h.owner.as_deref() == Some(owner)) {
                continue;
            }
            let list = Arc::make_mut(handlers);
            let before = list.len();
            list.retain(|h| h.owner.as_deref() != Some(owner));
            removed += before - list.len();
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }
}
