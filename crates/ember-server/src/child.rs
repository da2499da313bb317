//! Book-keeping for worker processes, parent side.

use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::Pid;

pub struct Child {
    pub pid: Pid,
    pub backend_id: i32,
    pub birth: u64,
}

#[derive(Default)]
pub struct Children {
    list: Vec<Child>,
}

impl Children {
    pub fn new() -> Children {
        Children::default()
    }

    pub fn add(&mut self, pid: Pid, backend_id: i32) {
        let birth = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.list.push(Child { pid, backend_id, birth });
    }

    /// Remove by pid, returning the backend it served.
    pub fn remove(&mut self, pid: Pid) -> Option<i32> {
        let pos = self.list.iter().position(|c| c.pid == pid)?;
        Some(self.list.remove(pos).backend_id)
    }

    pub fn count(&self) -> usize {
        self.list.len()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.list.iter().map(|c| c.pid).collect()
    }

    /// Workers forked before us belong to the parent; a fresh child
    /// starts with a clean table.
    pub fn clear(&mut self) {
        self.list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let mut ch = Children::new();
        ch.add(Pid::from_raw(100), 0);
        ch.add(Pid::from_raw(101), 1);
        assert_eq!(ch.count(), 2);
        assert_eq!(ch.remove(Pid::from_raw(100)), Some(0));
        assert_eq!(ch.remove(Pid::from_raw(100)), None);
        assert_eq!(ch.count(), 1);
    }
}
