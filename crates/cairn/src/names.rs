//! Memoized uid/gid to name lookups.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tracing::trace;

/// Source of user and group names.
pub trait NameResolver: Send + Sync {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Resolves names through the system user and group databases.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn user_name(&self, uid: u32) -> Option<String> {
        use nix::unistd::{Uid, User};
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        use nix::unistd::{Gid, Group};
        Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|group| group.name)
    }
}

/// Caches every answer from a [`NameResolver`], including "no such id".
///
/// Entries are never invalidated. Two threads missing on the same id at
/// once may both ask the resolver; the first answer stored wins.
pub struct NameCache {
    resolver: Box<dyn NameResolver>,
    users: Mutex<HashMap<u32, Option<String>>>,
    groups: Mutex<HashMap<u32, Option<String>>>,
}

impl std::fmt::Debug for NameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCache")
            .field("users", &self.users.lock().len())
            .field("groups", &self.groups.lock().len())
            .finish_non_exhaustive()
    }
}

impl NameCache {
    pub fn new(resolver: impl NameResolver + 'static) -> Self {
        Self {
            resolver: Box::new(resolver),
            users: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide cache backed by the system databases.
    pub fn shared() -> Arc<NameCache> {
        static SHARED: OnceLock<Arc<NameCache>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(NameCache::new(SystemResolver)))
            .clone()
    }

    pub fn user(&self, uid: u32) -> Option<String> {
        lookup(&self.users, uid, |id| {
            trace!(uid = id, "Resolving user name");
            self.resolver.user_name(id)
        })
    }

    pub fn group(&self, gid: u32) -> Option<String> {
        lookup(&self.groups, gid, |id| {
            trace!(gid = id, "Resolving group name");
            self.resolver.group_name(id)
        })
    }
}

fn lookup(
    map: &Mutex<HashMap<u32, Option<String>>>,
    id: u32,
    resolve: impl FnOnce(u32) -> Option<String>,
) -> Option<String> {
    if let Some(hit) = map.lock().get(&id) {
        return hit.clone();
    }

    // Resolve without holding the lock; the system lookup may be slow.
    let name = resolve(id);
    map.lock().entry(id).or_insert(name).clone()
}
