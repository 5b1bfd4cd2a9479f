//! Registry of live dispatchers.
//!
//! A registry maps a [`Token`] to the dispatcher registered under it and is
//! the unit of thread isolation: it is `!Send`, so each event loop thread
//! owns its own registry and nothing else can mutate it. Members are stored
//! in a slab for O(1) insert, lookup, and remove.
//!
//! The registry owns its members; a dispatcher only holds a weak reference
//! back to it. Dropping the last `Registry` value closes whatever is still
//! registered, delivering `handle_close` to each.

use crate::error::{Error, Result};
use crate::runtime::dispatcher::{Dispatcher, DispatcherHandle, Handler};
use slab::Slab;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Identity of a dispatcher within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Member {
    /// Dispatcher id, guards against a recycled slab slot.
    id: u64,
    handle: DispatcherHandle,
}

#[derive(Default)]
struct Members {
    slab: RefCell<Slab<Member>>,
}

impl Drop for Members {
    fn drop(&mut self) {
        let members = std::mem::take(self.slab.get_mut());
        if members.is_empty() {
            return;
        }
        debug!(members = members.len(), "Registry dropped, closing members");
        for (_, member) in members {
            // Busy only if the registry is dropped from inside a member's
            // own hook; that member closes when its handle goes away.
            let _ = member.handle.close();
        }
    }
}

/// Single-writer mapping from token to dispatcher.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct Registry {
    members: Rc<Members>,
}

/// Non-owning reference to a [`Registry`], held by its dispatchers.
#[derive(Clone, Default)]
pub(crate) struct WeakRegistry {
    members: Weak<Members>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.members.upgrade().map(|members| Registry { members })
    }
}

thread_local! {
    // Created on first use, lives as long as the thread.
    static THREAD_DEFAULT: Registry = Registry::new();
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The calling thread's default registry.
    ///
    /// Each thread gets its own; a registry is never shared across threads.
    pub fn thread_default() -> Registry {
        THREAD_DEFAULT.with(Registry::clone)
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            members: Rc::downgrade(&self.members),
        }
    }

    /// Add `dispatcher` with its `handler` as a new member.
    ///
    /// Fails with [`Error::Closed`] if the dispatcher was already closed.
    pub fn register<H: Handler>(
        &self,
        mut dispatcher: Dispatcher,
        handler: H,
    ) -> Result<DispatcherHandle> {
        if dispatcher.is_closed() {
            return Err(Error::Closed);
        }

        let mut members = self.members.slab.borrow_mut();
        let entry = members.vacant_entry();
        let token = Token(entry.key());
        dispatcher.attach(self.downgrade(), token);

        let id = dispatcher.id();
        let fd = dispatcher.fd();
        let handle = DispatcherHandle::new(dispatcher, Box::new(handler));
        entry.insert(Member {
            id,
            handle: handle.clone(),
        });

        debug!(token = token.0, fd = ?fd, "Dispatcher registered");
        Ok(handle)
    }

    /// Remove the member under `token` without closing it.
    pub fn unregister(&self, token: Token) -> Option<DispatcherHandle> {
        let removed = self.members.slab.borrow_mut().try_remove(token.0);
        removed.map(|member| {
            debug!(token = token.0, "Dispatcher unregistered");
            member.handle
        })
    }

    /// Remove `token` only if it still belongs to dispatcher `id`.
    pub(crate) fn release(&self, token: Token, id: u64) -> bool {
        let removed = {
            let mut members = self.members.slab.borrow_mut();
            let owned = members.get(token.0).map_or(false, |member| member.id == id);
            if owned {
                members.try_remove(token.0)
            } else {
                None
            }
        };
        removed.is_some()
    }

    pub fn get(&self, token: Token) -> Option<DispatcherHandle> {
        self.members
            .slab
            .borrow()
            .get(token.0)
            .map(|member| member.handle.clone())
    }

    pub fn contains(&self, token: Token) -> bool {
        self.members.slab.borrow().contains(token.0)
    }

    /// Whether `token` still refers to exactly this dispatcher.
    pub fn holds(&self, token: Token, handle: &DispatcherHandle) -> bool {
        self.members
            .slab
            .borrow()
            .get(token.0)
            .map_or(false, |member| member.handle.ptr_eq(handle))
    }

    /// Current members ordered by token.
    ///
    /// The view is detached from the registry: members registered or closed
    /// while it is being walked do not disturb it.
    pub fn snapshot_active(&self) -> Vec<(Token, DispatcherHandle)> {
        self.members
            .slab
            .borrow()
            .iter()
            .map(|(key, member)| (Token(key), member.handle.clone()))
            .collect()
    }

    /// Close every member, delivering `handle_close` to each.
    pub fn close_all(&self) {
        for (_, handle) in self.snapshot_active() {
            if let Err(e) = handle.close() {
                debug!(token = ?handle.token(), error = %e, "Member left open");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.slab.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.slab.borrow().is_empty()
    }

    /// Whether both values refer to the same registry.
    pub fn same_as(&self, other: &Registry) -> bool {
        Rc::ptr_eq(&self.members, &other.members)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("members", &self.len())
            .finish()
    }
}
