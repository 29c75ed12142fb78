use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};

use crate::collective::{validate_members, Collective, CollectiveError, GroupSpec};

/// In-process stand-in for a process group: one [`LocalCollective`] per thread,
/// all sharing one hub. A hub forms exactly one group.
#[derive(Debug)]
pub struct LocalHub {
    world_size: usize,
    barrier: Barrier,
    members: Mutex<Vec<GroupSpec>>,
    slots: Mutex<Vec<Vec<u8>>>,
}

impl LocalHub {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            members: Mutex::new(Vec::with_capacity(world_size)),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn member(self: &Arc<Self>) -> LocalCollective {
        LocalCollective {
            hub: self.clone(),
            joined: Mutex::new(None),
        }
    }
}

#[derive(Debug)]
pub struct LocalCollective {
    hub: Arc<LocalHub>,
    joined: Mutex<Option<GroupSpec>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalCollective {
    fn joined_rank(&self) -> Result<usize, CollectiveError> {
        let joined = *lock(&self.joined);
        joined.map(|spec| spec.rank).ok_or(CollectiveError::NotActive)
    }
}

impl Collective for LocalCollective {
    fn form_group(&self, spec: GroupSpec) -> Result<(), CollectiveError> {
        if self.is_active() {
            return Err(CollectiveError::AlreadyActive);
        }
        lock(&self.hub.members).push(spec);
        self.hub.barrier.wait();

        // every member sees the same join set, so every member reaches the same verdict
        let members = lock(&self.hub.members).clone();
        validate_members(&members, self.hub.world_size).map_err(CollectiveError::Rejected)?;

        *lock(&self.joined) = Some(spec);
        Ok(())
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.joined_rank()?;
        self.hub.barrier.wait();
        Ok(())
    }

    fn all_gather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError> {
        let rank = self.joined_rank()?;
        lock(&self.hub.slots)[rank] = payload.to_vec();
        self.hub.barrier.wait();
        let gathered = lock(&self.hub.slots).clone();
        // nobody may overwrite a slot before everyone has read it
        self.hub.barrier.wait();
        Ok(gathered)
    }

    fn is_active(&self) -> bool {
        lock(&self.joined).is_some()
    }

    fn destroy(&self) -> Result<(), CollectiveError> {
        lock(&self.joined)
            .take()
            .map(|_| ())
            .ok_or(CollectiveError::NotActive)
    }
}
