//! The typed fan-out bus at the root of the calculation graph.

use ahash::AHashMap as HashMap;
use std::{cell::RefCell, rc::Rc};
use warden_policy_core::model::{KeyKind, SyncStatus, Update};

/// A handler for datastore updates of one or more key kinds.
///
/// Returning `true` filters the update out: handlers registered after this
/// one (for the same key kind) do not see it.
pub trait UpdateHandler {
    fn on_update(&mut self, update: &Update) -> bool;
}

pub trait StatusHandler {
    fn on_status(&mut self, status: SyncStatus);
}

pub type SharedHandler = Rc<RefCell<dyn UpdateHandler>>;
pub type SharedStatusHandler = Rc<RefCell<dyn StatusHandler>>;

/// Fans updates out to handlers by key kind, in registration order.
///
/// Registration order is part of the graph's contract: it defines the order
/// in which parallel derivations of the same input observe it. Kinds with no
/// registered handler are ignored, which is how unknown entity kinds are
/// tolerated.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<KeyKind, Vec<SharedHandler>>,
    status_handlers: Vec<SharedStatusHandler>,
}

// === impl Dispatcher ===

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler for the given key kind.
    pub fn register(&mut self, kind: KeyKind, handler: SharedHandler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn register_status_handler(&mut self, handler: SharedStatusHandler) {
        self.status_handlers.push(handler);
    }

    /// Sends the update to each registered handler for its kind until one of
    /// them filters it out.
    pub fn dispatch(&mut self, update: &Update) {
        let handlers = match self.handlers.get(&update.kind()) {
            Some(handlers) => handlers,
            None => {
                tracing::debug!(kind = ?update.kind(), "No handlers for update kind");
                return;
            }
        };
        for handler in handlers {
            if handler.borrow_mut().on_update(update) {
                tracing::debug!(kind = ?update.kind(), "Update filtered out");
                break;
            }
        }
    }

    /// Broadcasts a datastore sync status change to every status handler.
    pub fn dispatch_status(&mut self, status: SyncStatus) {
        for handler in &self.status_handlers {
            handler.borrow_mut().on_status(status);
        }
    }
}

/// A dispatcher may itself be registered as a handler of another dispatcher;
/// this is how the local-endpoint dispatcher hangs off the all-updates one.
impl UpdateHandler for Dispatcher {
    fn on_update(&mut self, update: &Update) -> bool {
        self.dispatch(update);
        false
    }
}

impl StatusHandler for Dispatcher {
    fn on_status(&mut self, status: SyncStatus) {
        self.dispatch_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_policy_core::model::PolicyKey;

    struct Recorder {
        seen: usize,
        filter: bool,
    }

    impl UpdateHandler for Recorder {
        fn on_update(&mut self, _: &Update) -> bool {
            self.seen += 1;
            self.filter
        }
    }

    fn policy_delete(name: &str) -> Update {
        Update::Policy(
            PolicyKey {
                name: name.to_string(),
            },
            None,
        )
    }

    #[test]
    fn dispatches_in_registration_order_until_filtered() {
        let mut dispatcher = Dispatcher::new();
        let first = Rc::new(RefCell::new(Recorder {
            seen: 0,
            filter: true,
        }));
        let second = Rc::new(RefCell::new(Recorder {
            seen: 0,
            filter: false,
        }));
        dispatcher.register(KeyKind::Policy, first.clone());
        dispatcher.register(KeyKind::Policy, second.clone());

        dispatcher.dispatch(&policy_delete("a"));
        assert_eq!(first.borrow().seen, 1);
        assert_eq!(second.borrow().seen, 0, "filtered out by the first handler");
    }

    #[test]
    fn kinds_without_handlers_are_ignored() {
        let mut dispatcher = Dispatcher::new();
        let handler = Rc::new(RefCell::new(Recorder {
            seen: 0,
            filter: false,
        }));
        dispatcher.register(KeyKind::HostIp, handler.clone());

        dispatcher.dispatch(&policy_delete("a"));
        assert_eq!(handler.borrow().seen, 0);
    }
}
