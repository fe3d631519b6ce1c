//! The server: announcement tracking and per-client dataflow deltas.
//!
//! The server wraps a [`Resolver`], classifies incoming announcements,
//! drives resolver iteration to a fixed point, and computes for each
//! client the incremental difference between what it is running and what
//! the new query responses require: additions are sent as full subgraphs,
//! removals as deletion markers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use crate::error::{SrqlError, SrqlResult, ValidationError};
use crate::resolver::{Resolver, ResolverConfig, MAX_FIXED_POINT_ROUNDS};
use crate::subgraph::{AnnouncementKind, Document, Subgraph};
use crate::value::AttributeValue;

/// A client announcement held in the repository.
#[derive(Debug, Clone)]
pub struct Announcement {
    /// Repository id, `client-id:subgraph-id`.
    pub id: String,
    /// The announcing client.
    pub client_id: String,
    /// How the subgraph was classified.
    pub kind: AnnouncementKind,
    /// The announced subgraph.
    pub subgraph: Subgraph,
    /// When the announcement was received. Introspection only; never
    /// feeds resolver output.
    pub received_at: DateTime<Utc>,
}

impl Announcement {
    /// Classifies a subgraph and wraps it as an announcement.
    #[must_use]
    pub fn new(subgraph: Subgraph, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let kind = subgraph.kind();
        let id = format!("{client_id}:{}", subgraph.id);
        Self {
            id,
            client_id,
            kind,
            subgraph,
            received_at: Utc::now(),
        }
    }
}

/// Stores announcements by id, with a per-client back index.
#[derive(Debug, Clone, Default)]
pub struct AnnouncementRepository {
    store: BTreeMap<String, Announcement>,
    by_client: BTreeMap<String, BTreeSet<String>>,
}

impl AnnouncementRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an announcement with this id is stored.
    #[must_use]
    pub fn has(&self, announcement_id: &str) -> bool {
        self.store.contains_key(announcement_id)
    }

    /// Stores an announcement.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateAnnouncement`] if the id is
    /// already stored.
    pub fn add(&mut self, announcement: Announcement) -> Result<(), ValidationError> {
        if self.has(&announcement.id) {
            return Err(ValidationError::DuplicateAnnouncement {
                id: announcement.id,
            });
        }
        self.by_client
            .entry(announcement.client_id.clone())
            .or_default()
            .insert(announcement.id.clone());
        self.store.insert(announcement.id.clone(), announcement);
        Ok(())
    }

    /// Returns the announcement with this id.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::AnnouncementNotFound`] if absent.
    pub fn get(&self, announcement_id: &str) -> Result<&Announcement, ValidationError> {
        self.store
            .get(announcement_id)
            .ok_or_else(|| ValidationError::AnnouncementNotFound {
                id: announcement_id.to_string(),
            })
    }

    /// Removes the announcement with this id from both indices.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::AnnouncementNotFound`] if absent.
    pub fn delete(&mut self, announcement_id: &str) -> Result<(), ValidationError> {
        let announcement = self.store.remove(announcement_id).ok_or_else(|| {
            ValidationError::AnnouncementNotFound {
                id: announcement_id.to_string(),
            }
        })?;

        if let Some(ids) = self.by_client.get_mut(&announcement.client_id) {
            ids.remove(announcement_id);
            if ids.is_empty() {
                self.by_client.remove(&announcement.client_id);
            }
        }
        Ok(())
    }

    /// All announcement ids of one client.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ClientNotFound`] if the client has no
    /// stored announcements.
    pub fn ids_for_client(&self, client_id: &str) -> Result<BTreeSet<String>, ValidationError> {
        self.by_client
            .get(client_id)
            .cloned()
            .ok_or_else(|| ValidationError::ClientNotFound {
                client_id: client_id.to_string(),
            })
    }

    /// Number of stored announcements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// The announcement-processing front of the resolver.
#[derive(Debug, Default)]
pub struct Server {
    resolver: Resolver,
    announcements: AnnouncementRepository,
    client_state: BTreeMap<String, BTreeSet<String>>,
}

impl Server {
    /// Creates a server whose resolver uses the given configuration.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            resolver: Resolver::new(config),
            announcements: AnnouncementRepository::new(),
            client_state: BTreeMap::new(),
        }
    }

    /// Read access to the resolver.
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Read access to the announcement repository.
    #[must_use]
    pub fn announcements(&self) -> &AnnouncementRepository {
        &self.announcements
    }

    /// The set of subgraph ids currently running on a client.
    #[must_use]
    pub fn client_state(&self, client_id: &str) -> Option<&BTreeSet<String>> {
        self.client_state.get(client_id)
    }

    /// Classifies an announced subgraph and routes it: base facts and
    /// patterns and queries are registered, an empty subgraph deletes a
    /// previous announcement by id.
    ///
    /// # Errors
    ///
    /// Propagates registration and deletion failures.
    pub fn process_announcement(&mut self, subgraph: Subgraph, client_id: &str) -> SrqlResult<()> {
        let announcement = Announcement::new(subgraph, client_id);

        match announcement.kind {
            AnnouncementKind::SrgRegistration => {
                self.resolver
                    .register_srg(announcement.subgraph.clone(), client_id)?;
                self.announcements.add(announcement)?;
            }
            AnnouncementKind::Pattern => {
                self.resolver
                    .register_pattern(announcement.subgraph.clone(), client_id);
                self.announcements.add(announcement)?;
            }
            AnnouncementKind::Query => {
                self.resolver
                    .register_query(announcement.subgraph.clone(), client_id);
                self.announcements.add(announcement)?;
            }
            AnnouncementKind::Deletion => {
                trace!(id = %announcement.id, "deletion announcement");
                self.delete_announcement(
                    &announcement.id,
                    client_id,
                    &announcement.subgraph.name,
                )?;
            }
        }
        Ok(())
    }

    /// Deletes a previously issued announcement. An unknown id falls back
    /// to pattern-delete-by-name for this client.
    ///
    /// # Errors
    ///
    /// Propagates resolver deletion failures; deleting an unknown query is
    /// an error, an unknown pattern name is not.
    pub fn delete_announcement(
        &mut self,
        announcement_id: &str,
        client_id: &str,
        fallback_name: &str,
    ) -> SrqlResult<()> {
        info!(announcement_id, fallback_name, "deleting announcement");

        if self.announcements.has(announcement_id) {
            let announcement = self.announcements.get(announcement_id)?.clone();
            match announcement.kind {
                AnnouncementKind::SrgRegistration => {
                    trace!(id = %announcement.subgraph.id, "removing SRG registration");
                    self.resolver.delete_srg(&announcement.subgraph.id)?;
                }
                AnnouncementKind::Pattern => {
                    trace!(name = %announcement.subgraph.name, "removing pattern");
                    self.resolver
                        .delete_pattern(&announcement.subgraph.name, client_id)?;
                }
                AnnouncementKind::Query => {
                    trace!(name = %announcement.subgraph.name, "removing query");
                    self.resolver
                        .delete_query(&announcement.subgraph.name, client_id)?;
                }
                AnnouncementKind::Deletion => {
                    return Err(SrqlError::internal(
                        "deletion announcements are never stored",
                    ));
                }
            }
            self.announcements.delete(announcement_id)?;
        } else {
            trace!(name = fallback_name, "falling back to pattern delete");
            self.resolver.delete_pattern(fallback_name, client_id)?;
        }
        Ok(())
    }

    /// Deletes every announcement of a client.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ClientNotFound`] if the client has no
    /// announcements; propagates deletion failures.
    pub fn deregister_client(&mut self, client_id: &str) -> SrqlResult<()> {
        info!(client_id, "deregistering client");

        let ids = self.announcements.ids_for_client(client_id)?;
        for announcement_id in ids {
            self.delete_announcement(&announcement_id, client_id, "")?;
        }
        Ok(())
    }

    /// Runs the resolver to a fixed point (capped at
    /// [`MAX_FIXED_POINT_ROUNDS`] rounds), answers all queries, and
    /// computes the per-client incremental documents.
    ///
    /// Subgraphs a client is already running are not re-sent; subgraphs no
    /// longer required arrive as deletion markers. Input-edge references
    /// into subgraphs running on *other* clients are stripped and recorded
    /// as `remotePatternID`/`remoteEdgeName` attributes for the transport
    /// layer.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn generate_documents(&mut self) -> SrqlResult<BTreeMap<String, Document>> {
        // Rule recursion is bounded: stop when an iteration instantiates
        // nothing or the round cap is hit. Non-convergence is not an
        // error; the current SRG state is used.
        for round in 0..MAX_FIXED_POINT_ROUNDS {
            let applications = self.resolver.apply_all_patterns();
            debug!(round, applications, "fixed-point iteration");
            if applications == 0 {
                break;
            }
        }

        self.resolver.log_srg_state();
        let responses = self.resolver.process_queries();

        let mut documents: BTreeMap<String, Document> = BTreeMap::new();
        let mut new_state: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (client_id, query_responses) in &responses {
            documents.entry(client_id.clone()).or_default();
            let state = new_state.entry(client_id.clone()).or_default();

            for response in query_responses {
                for subgraph in &response.graphs {
                    if state.contains(&subgraph.id) {
                        // Already encountered on this run.
                        continue;
                    }
                    let running = self
                        .client_state
                        .get(client_id)
                        .is_some_and(|s| s.contains(&subgraph.id));
                    if running {
                        // Already running on the client; keep, do not re-send.
                        state.insert(subgraph.id.clone());
                        continue;
                    }

                    documents
                        .get_mut(client_id)
                        .expect("document entry created above")
                        .add_subgraph(subgraph.clone());
                    state.insert(subgraph.id.clone());
                }
            }
        }

        // Strip edge references that point at subgraphs running on other
        // clients; the transport layer reconnects them remotely.
        for (client_id, document) in &mut documents {
            let Some(state) = new_state.get(client_id) else {
                continue;
            };
            for subgraph in &mut document.subgraphs {
                for edge in subgraph.graph.edges_mut() {
                    if !edge.data.is_input() {
                        continue;
                    }
                    let remote = edge
                        .data
                        .edge_ref
                        .as_ref()
                        .is_some_and(|r| !state.contains(&r.subgraph_id));
                    if remote {
                        let reference = edge.data.edge_ref.take().expect("checked above");
                        trace!(
                            subgraph = %subgraph.id,
                            edge = %edge.name,
                            reference = %reference,
                            "scrubbing remote edge reference"
                        );
                        edge.data
                            .attributes
                            .set("remotePatternID", AttributeValue::text(reference.subgraph_id));
                        edge.data
                            .attributes
                            .set("remoteEdgeName", AttributeValue::text(reference.edge_name));
                    }
                }
            }
        }

        // Everything running before but absent now gets a deletion marker.
        for (client_id, old_ids) in &self.client_state {
            let document = documents.entry(client_id.clone()).or_default();
            let still_running = new_state.get(client_id);
            for subgraph_id in old_ids {
                let kept = still_running.is_some_and(|s| s.contains(subgraph_id));
                if !kept {
                    document.add_subgraph(Subgraph::deletion_marker(subgraph_id.clone()));
                }
            }
        }

        self.client_state = new_state;
        Ok(documents)
    }
}
