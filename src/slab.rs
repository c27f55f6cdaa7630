// src/slab.rs
use std::sync::Arc;

use crate::conn::Connection;

/// Connection table owned by the reactor thread.
///
/// Slot indices double as epoll tokens, so a readiness event maps straight
/// back to its connection. Capacity is the configured open-connection
/// ceiling; `insert_with` fails once every slot is taken.
pub struct ConnectionSlab {
    entries: Vec<Option<Arc<Connection>>>,
    free: Vec<usize>,
    active: usize,
}

impl ConnectionSlab {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            active: 0,
        }
    }

    /// Reserve a slot and build the connection with its id.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(usize) -> Arc<Connection>,
    ) -> Option<usize> {
        let id = self.free.pop()?;
        self.entries[id] = Some(build(id));
        self.active += 1;
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Connection>> {
        self.entries.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn remove(&mut self, id: usize) -> Option<Arc<Connection>> {
        let conn = self.entries.get_mut(id)?.take()?;
        self.free.push(id);
        self.active -= 1;
        Some(conn)
    }

    pub fn active_ids(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(fd: i32, id: usize) -> Arc<Connection> {
        Arc::new(Connection::new(fd, id, "127.0.0.1:0".parse().unwrap()))
    }

    #[test]
    fn allocates_frees_and_reuses_slots() {
        let mut slab = ConnectionSlab::new(4);
        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 4);

        let a = slab.insert_with(|id| conn(10, id)).unwrap();
        let b = slab.insert_with(|id| conn(11, id)).unwrap();
        assert_ne!(a, b);
        assert_eq!(slab.get(a).unwrap().fd, 10);
        assert_eq!(slab.get(a).unwrap().id, a);

        assert!(slab.remove(a).is_some());
        assert_eq!(slab.len(), 1);
        assert!(slab.get(a).is_none());

        // The freed slot is handed out again.
        let c = slab.insert_with(|id| conn(12, id)).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn refuses_past_capacity() {
        let mut slab = ConnectionSlab::new(2);
        slab.insert_with(|id| conn(1, id)).unwrap();
        slab.insert_with(|id| conn(2, id)).unwrap();
        assert!(slab.insert_with(|id| conn(3, id)).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut slab = ConnectionSlab::new(2);
        let id = slab.insert_with(|id| conn(1, id)).unwrap();
        assert!(slab.remove(id).is_some());
        assert!(slab.remove(id).is_none());
        assert!(slab.is_empty());
    }

    #[test]
    fn active_ids_tracks_live_slots() {
        let mut slab = ConnectionSlab::new(4);
        let a = slab.insert_with(|id| conn(1, id)).unwrap();
        let b = slab.insert_with(|id| conn(2, id)).unwrap();
        slab.remove(a);
        assert_eq!(slab.active_ids(), vec![b]);
    }
}
