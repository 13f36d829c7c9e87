//! In-process ranks connected by channels

use super::{check_root, Communicator, ROOT};
use crate::error::{CommError, CommResult};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Factory for a group of in-process ranks
pub struct LocalGroup;

impl LocalGroup {
    /// One communicator per rank, indexed by rank
    ///
    /// Each communicator is moved to its own thread. Every non-root rank has
    /// a pair of FIFO channels to root, so successive collectives never mix.
    pub fn create(size: usize) -> Vec<LocalCommunicator> {
        let size = size.max(1);
        let mut from_members = Vec::with_capacity(size - 1);
        let mut to_members = Vec::with_capacity(size - 1);
        let mut members = Vec::with_capacity(size - 1);

        for rank in 1..size {
            let (up_tx, up_rx) = unbounded();
            let (down_tx, down_rx) = unbounded();
            from_members.push(up_rx);
            to_members.push(down_tx);
            members.push(LocalCommunicator {
                rank,
                size,
                role: Role::Member {
                    to_root: up_tx,
                    from_root: down_rx,
                },
            });
        }

        let root = LocalCommunicator {
            rank: ROOT,
            size,
            role: Role::Root {
                from_members,
                to_members,
            },
        };
        std::iter::once(root).chain(members).collect()
    }
}

enum Role {
    Root {
        /// Indexed by rank - 1
        from_members: Vec<Receiver<Vec<u8>>>,
        to_members: Vec<Sender<Vec<u8>>>,
    },
    Member {
        to_root: Sender<Vec<u8>>,
        from_root: Receiver<Vec<u8>>,
    },
}

/// One rank of a [`LocalGroup`]
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    role: Role,
}

fn lost(peer: usize) -> CommError {
    CommError::PeerLost {
        peer,
        reason: "channel disconnected".into(),
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&mut self, root: usize, data: Option<Vec<u8>>) -> CommResult<Vec<u8>> {
        check_root(root)?;
        match &self.role {
            Role::Root { to_members, .. } => {
                let data = data.ok_or_else(|| CommError::Protocol("root broadcast without data".into()))?;
                for (i, tx) in to_members.iter().enumerate() {
                    tx.send(data.clone()).map_err(|_| lost(i + 1))?;
                }
                Ok(data)
            }
            Role::Member { from_root, .. } => from_root.recv().map_err(|_| lost(ROOT)),
        }
    }

    fn gather_bytes(&mut self, root: usize, data: Vec<u8>) -> CommResult<Option<Vec<Vec<u8>>>> {
        check_root(root)?;
        match &self.role {
            Role::Root { from_members, .. } => {
                let mut parts = Vec::with_capacity(self.size);
                parts.push(data);
                for (i, rx) in from_members.iter().enumerate() {
                    parts.push(rx.recv().map_err(|_| lost(i + 1))?);
                }
                Ok(Some(parts))
            }
            Role::Member { to_root, .. } => {
                to_root.send(data).map_err(|_| lost(ROOT))?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_rank_group() {
        let mut group = LocalGroup::create(1);
        let mut root = group.remove(0);
        assert_eq!(root.size(), 1);
        assert_eq!(root.broadcast_bytes(0, Some(vec![1])).unwrap(), vec![1]);
        assert_eq!(root.gather_bytes(0, vec![2]).unwrap(), Some(vec![vec![2]]));
    }

    #[test]
    fn test_unsupported_root() {
        let mut group = LocalGroup::create(2);
        assert!(matches!(
            group[1].gather_bytes(1, vec![]),
            Err(CommError::UnsupportedRoot(1))
        ));
    }

    #[test]
    fn test_peer_lost() {
        let mut group = LocalGroup::create(2);
        let member = group.pop();
        drop(member);
        assert!(matches!(
            group[0].gather_bytes(0, vec![]),
            Err(CommError::PeerLost { peer: 1, .. })
        ));
    }

    #[test]
    fn test_successive_gathers_stay_ordered() {
        let mut group = LocalGroup::create(2);
        let mut member = group.pop().unwrap();
        let mut root = group.pop().unwrap();
        let t = thread::spawn(move || {
            member.gather_bytes(0, vec![1]).unwrap();
            member.gather_bytes(0, vec![2]).unwrap();
        });
        t.join().unwrap();
        assert_eq!(root.gather_bytes(0, vec![0]).unwrap().unwrap()[1], vec![1]);
        assert_eq!(root.gather_bytes(0, vec![0]).unwrap().unwrap()[1], vec![2]);
    }
}
