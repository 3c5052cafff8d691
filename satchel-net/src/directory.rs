//! The peer directory: a bounded, TTL'd cache of peers this node has seen
//! or heard announcements from.

use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use common::{constants, time::TimestampMs};
use libp2p::PeerId;
use lru::LruCache;
use serde::{Deserialize, Serialize};

/// A service announcement, published periodically on the announce topic
/// and consumed into the directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: String,
    pub services: Vec<String>,
    pub addrs: Vec<String>,
    pub timestamp: TimestampMs,
}

/// A directory entry, serializable for the control plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub services: Vec<String>,
    pub last_seen: TimestampMs,
}

struct Entry {
    info: PeerInfo,
    refreshed: Instant,
}

/// Bounded cache (default capacity 1000) with a one-hour TTL. Eviction is
/// LRU on insert; expired entries are filtered on read.
pub struct PeerDirectory {
    entries: Mutex<LruCache<PeerId, Entry>>,
    ttl: Duration,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new(
            constants::PEER_DIRECTORY_CAPACITY,
            constants::PEER_DIRECTORY_TTL,
        )
    }
}

impl PeerDirectory {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Record that a peer was seen on the transport, optionally at `addr`.
    pub fn record_seen(&self, peer: PeerId, addr: Option<String>) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get_mut(&peer) {
            Some(entry) => {
                entry.refreshed = now;
                entry.info.last_seen = TimestampMs::now();
                if let Some(addr) = addr {
                    if !entry.info.addrs.contains(&addr) {
                        entry.info.addrs.push(addr);
                    }
                }
            }
            None => {
                entries.put(
                    peer,
                    Entry {
                        info: PeerInfo {
                            peer_id: peer.to_string(),
                            addrs: addr.into_iter().collect(),
                            services: Vec::new(),
                            last_seen: TimestampMs::now(),
                        },
                        refreshed: now,
                    },
                );
            }
        }
    }

    /// Merge an announcement into the directory.
    pub fn record_announcement(
        &self,
        peer: PeerId,
        announcement: &Announcement,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.put(
            peer,
            Entry {
                info: PeerInfo {
                    peer_id: peer.to_string(),
                    addrs: announcement.addrs.clone(),
                    services: announcement.services.clone(),
                    last_seen: TimestampMs::now(),
                },
                refreshed: Instant::now(),
            },
        );
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerInfo> {
        let mut entries = self.entries.lock().unwrap();
        let fresh = entries
            .get(peer)
            .map(|entry| (entry.refreshed.elapsed() <= self.ttl, entry.info.clone()));
        match fresh {
            Some((true, info)) => Some(info),
            Some((false, _)) => {
                entries.pop(peer);
                None
            }
            None => None,
        }
    }

    /// Every unexpired entry, most recently seen first.
    pub fn list(&self) -> Vec<PeerInfo> {
        let entries = self.entries.lock().unwrap();
        let mut infos: Vec<PeerInfo> = entries
            .iter()
            .filter(|(_, entry)| entry.refreshed.elapsed() <= self.ttl)
            .map(|(_, entry)| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        infos
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_and_get() {
        let directory = PeerDirectory::default();
        let peer = PeerId::random();

        directory.record_seen(peer, Some("/ip4/1.2.3.4/tcp/9011".to_owned()));
        let info = directory.get(&peer).unwrap();
        assert_eq!(info.peer_id, peer.to_string());
        assert_eq!(info.addrs, vec!["/ip4/1.2.3.4/tcp/9011".to_owned()]);

        // A repeat sighting dedups the address.
        directory.record_seen(peer, Some("/ip4/1.2.3.4/tcp/9011".to_owned()));
        assert_eq!(directory.get(&peer).unwrap().addrs.len(), 1);
    }

    #[test]
    fn announcement_overwrites_services() {
        let directory = PeerDirectory::default();
        let peer = PeerId::random();

        directory.record_announcement(
            peer,
            &Announcement {
                peer_id: peer.to_string(),
                services: vec!["time".to_owned(), "weather".to_owned()],
                addrs: vec!["/ip4/1.2.3.4/tcp/9011".to_owned()],
                timestamp: TimestampMs::now(),
            },
        );

        let info = directory.get(&peer).unwrap();
        assert_eq!(info.services.len(), 2);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let directory = PeerDirectory::new(2, Duration::from_secs(3600));
        let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());

        directory.record_seen(a, None);
        directory.record_seen(b, None);
        directory.record_seen(c, None);

        assert_eq!(directory.len(), 2);
        assert!(directory.get(&a).is_none());
        assert!(directory.get(&c).is_some());
    }

    #[test]
    fn expired_entries_are_invisible() {
        let directory = PeerDirectory::new(10, Duration::from_secs(0));
        let peer = PeerId::random();

        directory.record_seen(peer, None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(directory.get(&peer).is_none());
        assert!(directory.list().is_empty());
    }
}
