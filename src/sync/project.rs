//! Project-wide operations: structural batches and project reads.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::updater::Synchronizer;
use super::{SyncError, SyncResult};
use crate::cache::DocumentCache;
use crate::document::Document;
use crate::history::{AddEntry, Entity, HistoryManager, HistoryMeta, RenameEntry};
use crate::lock::{project_lock_key, LockManager};

/// One structural change in a batch. A rename to an empty pathname
/// records a removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProjectUpdate {
    RenameDoc {
        id: String,
        pathname: String,
        #[serde(rename = "newPathname")]
        new_pathname: String,
    },
    RenameFile {
        id: String,
        pathname: String,
        #[serde(rename = "newPathname")]
        new_pathname: String,
    },
    AddDoc {
        id: String,
        pathname: String,
        #[serde(rename = "docLines", default)]
        doc_lines: Option<String>,
    },
    AddFile {
        id: String,
        pathname: String,
        url: String,
    },
}

/// A document as listed for a project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub lines: Vec<String>,
    pub v: u64,
}

impl From<Document> for ProjectDoc {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.doc_id,
            lines: doc.lines,
            v: doc.version,
        }
    }
}

pub struct ProjectCoordinator {
    synchronizer: Arc<Synchronizer>,
    cache: Arc<DocumentCache>,
    locks: Arc<LockManager>,
    history: Arc<HistoryManager>,
}

impl ProjectCoordinator {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        locks: Arc<LockManager>,
        history: Arc<HistoryManager>,
    ) -> Self {
        Self {
            cache: synchronizer.manager().cache().clone(),
            synchronizer,
            locks,
            history,
        }
    }

    /// Apply a batch of structural changes under the project lock.
    ///
    /// The i-th change is recorded at sub-version `{version}.{i}`. The batch
    /// stops at the first failure; changes before it stay applied.
    pub async fn update_project_with_locks(
        &self,
        project_id: &str,
        project_history_id: Option<String>,
        user_id: Option<String>,
        updates: Vec<ProjectUpdate>,
        version: &str,
    ) -> SyncResult<()> {
        let key = project_lock_key(project_id);
        self.locks
            .run_with_lock(&key, || {
                self.update_project(project_id, project_history_id, user_id, updates, version)
            })
            .await
    }

    async fn update_project(
        &self,
        project_id: &str,
        project_history_id: Option<String>,
        user_id: Option<String>,
        updates: Vec<ProjectUpdate>,
        version: &str,
    ) -> SyncResult<()> {
        let start_len = self.history.queue().len(project_id)?;
        let mut queue_len = start_len;

        for (index, update) in updates.into_iter().enumerate() {
            let sub_version = format!("{}.{}", version, index);
            debug!(
                "Applying {:?} to project {} at {}",
                update, project_id, sub_version
            );
            queue_len = match update {
                ProjectUpdate::RenameDoc {
                    id,
                    pathname,
                    new_pathname,
                } => {
                    self.synchronizer
                        .rename_doc_with_lock(
                            project_id,
                            &id,
                            &pathname,
                            &new_pathname,
                            &sub_version,
                            user_id.clone(),
                            project_history_id.clone(),
                        )
                        .await?
                }
                ProjectUpdate::RenameFile {
                    id,
                    pathname,
                    new_pathname,
                } => self.history.queue().push(
                    project_id,
                    &[RenameEntry {
                        entity: Entity::File(id),
                        pathname,
                        new_pathname,
                        version: sub_version,
                        meta: HistoryMeta::new(user_id.clone()),
                        project_history_id: project_history_id.clone(),
                    }],
                )?,
                ProjectUpdate::AddDoc {
                    id,
                    pathname,
                    doc_lines,
                } => {
                    if let Some(text) = &doc_lines {
                        self.seed_new_doc(project_id, &id, &pathname, text, &project_history_id)
                            .await?;
                    }
                    self.history.queue().push(
                        project_id,
                        &[AddEntry {
                            entity: Entity::Doc(id),
                            pathname,
                            doc_lines,
                            url: None,
                            version: sub_version,
                            meta: HistoryMeta::new(user_id.clone()),
                            project_history_id: project_history_id.clone(),
                        }],
                    )?
                }
                ProjectUpdate::AddFile { id, pathname, url } => self.history.queue().push(
                    project_id,
                    &[AddEntry {
                        entity: Entity::File(id),
                        pathname,
                        doc_lines: None,
                        url: Some(url),
                        version: sub_version,
                        meta: HistoryMeta::new(user_id.clone()),
                        project_history_id: project_history_id.clone(),
                    }],
                )?,
            };
        }

        info!(
            "Applied {} structural changes to project {}",
            queue_len.saturating_sub(start_len),
            project_id
        );
        self.history.flush_if_threshold_crossed(
            project_id,
            queue_len,
            queue_len.saturating_sub(start_len),
        );
        Ok(())
    }

    /// Cache a freshly added document at version 0, marked unflushed so the
    /// next flush creates its durable record.
    async fn seed_new_doc(
        &self,
        project_id: &str,
        doc_id: &str,
        pathname: &str,
        text: &str,
        project_history_id: &Option<String>,
    ) -> SyncResult<()> {
        if self.cache.is_loaded(doc_id) {
            return Ok(());
        }
        match self
            .synchronizer
            .manager()
            .persistence()
            .get_doc(project_id, doc_id)
            .await
        {
            Ok(_) => {
                debug!("Added doc {} already has a durable record", doc_id);
                return Ok(());
            }
            Err(e) => match SyncError::from(e) {
                SyncError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        let lines = text.split('\n').map(str::to_string).collect();
        let doc = Document::new(project_id, doc_id, lines, 0)
            .with_pathname(pathname)
            .with_project_history_id(project_history_id.clone());
        self.cache.put_doc_in_memory(&doc)?;
        self.cache.mark_dirty(doc_id);
        debug!("Seeded new doc {} in project {}", doc_id, project_id);
        Ok(())
    }

    /// Every cached document of the project, provided the caller's view of
    /// the project is still current. Old unflushed changes are flushed on
    /// the way.
    pub async fn get_project_docs_and_flush_if_old(
        &self,
        project_id: &str,
        state: &str,
    ) -> SyncResult<Vec<ProjectDoc>> {
        if self.cache.check_or_set_project_state(project_id, state)? {
            debug!("Project {} state changed, refusing to list docs", project_id);
            return Err(SyncError::ProjectStateChanged(project_id.to_string()));
        }

        let mut docs = Vec::new();
        for doc_id in self.cache.doc_ids_in_project(project_id)? {
            match self
                .synchronizer
                .get_doc_and_flush_if_old_with_lock(project_id, &doc_id)
                .await
            {
                Ok(doc) => docs.push(ProjectDoc::from(doc)),
                Err(e) => {
                    warn!("Failed to read doc {} of project {}: {}", doc_id, project_id, e);
                    self.cache.clear_project_state(project_id);
                    return Err(e);
                }
            }
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{doc_lock_key, LockConfig};
    use crate::sync::DispatchConfig;
    use crate::test_support::{lines, seed_durable, TestService};
    use crate::storage::DocPersistence;
    use std::time::Duration;

    fn rename(id: &str, from: &str, to: &str) -> ProjectUpdate {
        ProjectUpdate::RenameDoc {
            id: id.into(),
            pathname: from.into(),
            new_pathname: to.into(),
        }
    }

    #[test]
    fn test_project_update_wire_format() {
        let parsed: Vec<ProjectUpdate> = serde_json::from_value(serde_json::json!([
            {"type": "rename-doc", "id": "d1", "pathname": "/a.tex", "newPathname": "/b.tex"},
            {"type": "add-file", "id": "f1", "pathname": "/img.png", "url": "http://files/f1"},
            {"type": "add-doc", "id": "d2", "pathname": "/c.tex"}
        ]))
        .unwrap();
        assert_eq!(parsed[0], rename("d1", "/a.tex", "/b.tex"));
        assert!(matches!(&parsed[1], ProjectUpdate::AddFile { url, .. } if url == "http://files/f1"));
        assert!(matches!(&parsed[2], ProjectUpdate::AddDoc { doc_lines: None, .. }));
    }

    #[tokio::test]
    async fn test_rename_batch_gets_ordered_sub_versions() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d1", &["one"], 0).await;
        seed_durable(&svc, "p", "d2", &["two"], 0).await;
        svc.synchronizer.get_doc_with_lock("p", "d1").await.unwrap();

        let updates = vec![
            rename("d1", "/d1.tex", "/chapters/one.tex"),
            rename("d2", "/d2.tex", "/chapters/two.tex"),
            ProjectUpdate::AddFile {
                id: "f1".into(),
                pathname: "/fig.png".into(),
                url: "http://files/f1".into(),
            },
        ];
        svc.projects
            .update_project_with_locks("p", Some("h1".into()), Some("u1".into()), updates, "7")
            .await
            .unwrap();

        let pending = svc.history.queue().pending("p").unwrap();
        let versions: Vec<_> = pending.iter().map(|e| e["version"].clone()).collect();
        assert_eq!(versions, vec!["7.0", "7.1", "7.2"]);
        assert_eq!(pending[0]["doc"], "d1");
        assert_eq!(pending[2]["file"], "f1");
        assert_eq!(pending[2]["projectHistoryId"], "h1");

        let doc = svc.synchronizer.get_doc_with_lock("p", "d1").await.unwrap();
        assert_eq!(doc.pathname, "/chapters/one.tex");
        assert!(!svc.cache.is_loaded("d2"));
    }

    #[tokio::test]
    async fn test_added_doc_is_cached_and_flushed() {
        let svc = TestService::new();
        let updates = vec![ProjectUpdate::AddDoc {
            id: "new".into(),
            pathname: "/new.tex".into(),
            doc_lines: Some("first\nsecond".into()),
        }];
        svc.projects
            .update_project_with_locks("p", None, None, updates, "1")
            .await
            .unwrap();

        let doc = svc.synchronizer.get_doc_with_lock("p", "new").await.unwrap();
        assert_eq!(doc.lines, lines(&["first", "second"]));
        assert_eq!(doc.version, 0);
        assert!(doc.is_dirty());

        svc.flush.flush_project("p").await.unwrap();
        let stored = svc.persistence.get_doc("p", "new").await.unwrap();
        assert_eq!(stored.pathname, "/new.tex");
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let svc = TestService::new();
        let updates = vec![
            ProjectUpdate::AddDoc {
                id: "bad".into(),
                pathname: "/bad.tex".into(),
                doc_lines: Some("nul\u{0}byte".into()),
            },
            ProjectUpdate::AddFile {
                id: "f1".into(),
                pathname: "/fig.png".into(),
                url: "http://files/f1".into(),
            },
        ];
        let err = svc
            .projects
            .update_project_with_locks("p", None, None, updates, "3")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Corrupted(_)));
        assert_eq!(svc.history.queue().len("p").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_waits_for_doc_lock() {
        let svc = TestService::with_configs(
            LockConfig::default()
                .with_max_wait(Duration::from_millis(20))
                .with_poll_interval(Duration::from_millis(5)),
            DispatchConfig::default(),
        );
        seed_durable(&svc, "p", "d1", &["one"], 0).await;
        let _held = svc.locks.try_lock(&doc_lock_key("d1")).unwrap();

        let err = svc
            .projects
            .update_project_with_locks("p", None, None, vec![rename("d1", "/a", "/b")], "1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout(_)));
        assert!(!svc.locks.is_locked(&project_lock_key("p")));
    }

    #[tokio::test]
    async fn test_project_docs_require_stable_state() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d1", &["one"], 4).await;
        svc.synchronizer.get_doc_with_lock("p", "d1").await.unwrap();

        let err = svc
            .projects
            .get_project_docs_and_flush_if_old("p", "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ProjectStateChanged(_)));

        let docs = svc
            .projects
            .get_project_docs_and_flush_if_old("p", "s1")
            .await
            .unwrap();
        assert_eq!(
            docs,
            vec![ProjectDoc {
                id: "d1".into(),
                lines: lines(&["one"]),
                v: 4
            }]
        );

        assert!(svc
            .projects
            .get_project_docs_and_flush_if_old("p", "s2")
            .await
            .is_err());
    }
}
