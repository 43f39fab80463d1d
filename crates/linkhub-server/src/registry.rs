//! Identified connections, indexed by nid and by link type.

use chrono::{DateTime, Utc};
use linkhub_core::{LinkType, NULL_DESTINATION, Nid, Package, is_link_type};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// An identified connection the hub can route to.
#[derive(Debug)]
pub struct ConnectedClient {
    pub nid: Nid,
    pub link_type: LinkType,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    session: u64,
    outbox: mpsc::UnboundedSender<Package>,
}

impl ConnectedClient {
    pub fn new(
        nid: Nid,
        link_type: LinkType,
        remote_addr: SocketAddr,
        connected_at: DateTime<Utc>,
        session: u64,
        outbox: mpsc::UnboundedSender<Package>,
    ) -> Self {
        Self {
            nid,
            link_type,
            remote_addr,
            connected_at,
            session,
            outbox,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Queue a package for this client's writer.
    ///
    /// Never waits. Fails only once the client's connection task has ended.
    pub fn send(&self, package: Package) -> Result<(), Package> {
        self.outbox.send(package).map_err(|e| e.0)
    }
}

/// Error inserting into the [`Registry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("nid {0} is already connected")]
    DuplicateNid(Nid),
    #[error("nid {0} is reserved")]
    ReservedNid(Nid),
}

/// Every identified connection.
#[derive(Debug, Default)]
pub struct Registry {
    by_nid: HashMap<Nid, ConnectedClient>,
    by_link_type: HashMap<LinkType, BTreeSet<Nid>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly identified client. A nid can only be held by one
    /// connection at a time.
    pub fn insert(&mut self, client: ConnectedClient) -> Result<(), RegistryError> {
        if client.nid.as_str() == NULL_DESTINATION {
            return Err(RegistryError::ReservedNid(client.nid));
        }
        if self.by_nid.contains_key(&client.nid) {
            return Err(RegistryError::DuplicateNid(client.nid));
        }
        self.by_link_type
            .entry(client.link_type.clone())
            .or_default()
            .insert(client.nid.clone());
        self.by_nid.insert(client.nid.clone(), client);
        Ok(())
    }

    /// Remove `nid` if it still belongs to `session`.
    pub fn remove(&mut self, nid: &Nid, session: u64) -> Option<ConnectedClient> {
        if self.by_nid.get(nid)?.session != session {
            return None;
        }
        let client = self.by_nid.remove(nid)?;
        if let Some(nids) = self.by_link_type.get_mut(&client.link_type) {
            nids.remove(nid);
            if nids.is_empty() {
                self.by_link_type.remove(&client.link_type);
            }
        }
        Some(client)
    }

    /// The client holding `nid`, if connected.
    pub fn find_by_nid(&self, nid: &str) -> Option<&ConnectedClient> {
        self.by_nid.get(nid)
    }

    /// Every client that identified with `link_type`, ordered by nid.
    pub fn find_by_link_type(&self, link_type: &str) -> Vec<&ConnectedClient> {
        self.by_link_type
            .get(link_type)
            .into_iter()
            .flatten()
            .filter_map(|nid| self.by_nid.get(nid))
            .collect()
    }

    /// Clients a package addressed to `destination` should reach.
    ///
    /// `NULL` reaches nobody. A registered nid reaches that client, even if
    /// a link type with the same spelling exists. Otherwise a link type
    /// reaches every client of that type. Anything else reaches nobody.
    pub fn resolve(&self, destination: &str) -> Vec<&ConnectedClient> {
        if destination == NULL_DESTINATION {
            return Vec::new();
        }
        if let Some(client) = self.find_by_nid(destination) {
            return vec![client];
        }
        if is_link_type(destination) {
            return self.find_by_link_type(destination);
        }
        Vec::new()
    }

    /// Number of identified clients.
    pub fn len(&self) -> usize {
        self.by_nid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_nid.is_empty()
    }
}
