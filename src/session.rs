//! Session state and the process-wide session registry.
//!
//! A [`SessionStore`] maps session ids to [`SessionSlot`]s. Each slot guards
//! its [`Session`] with an async mutex so at most one turn runs per session;
//! a second request fails fast with [`Error::SessionBusy`] instead of queuing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::llm::Usage;
use crate::sandbox::{PreviewHandle, Sandbox};
use crate::workflow::WorkflowName;

/// Ordered, append-only list of a session's instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstructionHistory(Vec<String>);

impl InstructionHistory {
    pub fn push(&mut self, instruction: impl Into<String>) {
        self.0.push(instruction.into());
    }

    /// Instructions, oldest first.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// One live editing session.
pub struct Session {
    id: String,
    project_name: String,
    sandbox: Box<dyn Sandbox>,
    created_at: DateTime<Utc>,
    history: InstructionHistory,
    active_workflow: Option<WorkflowName>,
    pinned_workflow: Option<WorkflowName>,
    preview: Option<Box<dyn PreviewHandle>>,
    usage: Usage,
    turns: u32,
}

impl Session {
    pub fn new(
        project_name: impl Into<String>,
        sandbox: Box<dyn Sandbox>,
        pinned_workflow: Option<WorkflowName>,
    ) -> Self {
        Self {
            id: sandbox.id().to_string(),
            project_name: project_name.into(),
            sandbox,
            created_at: Utc::now(),
            history: InstructionHistory::default(),
            active_workflow: pinned_workflow,
            pinned_workflow,
            preview: None,
            usage: Usage::default(),
            turns: 0,
        }
    }

    pub fn with_preview(mut self, preview: Box<dyn PreviewHandle>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    pub fn sandbox_path(&self) -> &Path {
        self.sandbox.path()
    }

    pub fn pristine_snapshot_path(&self) -> &Path {
        self.sandbox.pristine_path()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn history(&self) -> &InstructionHistory {
        &self.history
    }

    pub fn active_workflow(&self) -> Option<WorkflowName> {
        self.active_workflow
    }

    pub fn pinned_workflow(&self) -> Option<WorkflowName> {
        self.pinned_workflow
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    /// Records a finished turn, successful or not.
    pub(crate) fn record_turn(&mut self, instruction: &str, workflow: WorkflowName, usage: Usage) {
        self.history.push(instruction);
        self.active_workflow = Some(workflow);
        self.usage += usage;
        self.turns += 1;
    }

    /// Stops the preview (if any) and removes the sandbox.
    pub(crate) async fn release(&mut self) -> Result<()> {
        if let Some(mut preview) = self.preview.take() {
            if let Err(e) = preview.stop().await {
                tracing::warn!(session_id = %self.id, error = %e, "failed to stop preview");
            }
        }
        self.sandbox.cleanup()
    }

    /// Serializable view of the session.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            project_name: self.project_name.clone(),
            sandbox_path: self.sandbox.path().clone(),
            pristine_snapshot_path: self.sandbox.pristine_path().clone(),
            created_at: self.created_at,
            instruction_history: self.history.to_vec(),
            active_workflow: self.active_workflow,
            pinned_workflow: self.pinned_workflow,
            preview_url: self.preview.as_ref().and_then(|p| p.url().map(str::to_string)),
            usage: self.usage,
            turns: self.turns,
        }
    }
}

/// Snapshot of a session for callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub project_name: String,
    pub sandbox_path: PathBuf,
    pub pristine_snapshot_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub instruction_history: Vec<String>,
    pub active_workflow: Option<WorkflowName>,
    pub pinned_workflow: Option<WorkflowName>,
    pub preview_url: Option<String>,
    pub usage: Usage,
    pub turns: u32,
}

/// A registry entry: the session behind its turn lock, plus a stop flag.
pub struct SessionSlot {
    id: String,
    session: Arc<Mutex<Session>>,
    cancel: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            id: session.id().to_string(),
            session: Arc::new(Mutex::new(session)),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Takes the turn lock or fails with [`Error::SessionBusy`].
    pub fn try_acquire(&self) -> Result<OwnedMutexGuard<Session>> {
        self.session
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::SessionBusy(self.id.clone()))
    }

    /// Waits for the turn lock.
    pub async fn acquire(&self) -> OwnedMutexGuard<Session> {
        self.session.clone().lock_owned().await
    }

    /// Asks any in-flight turn to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }
}

/// Injectable registry of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under its id.
    pub async fn insert(&self, session: Session) -> Arc<SessionSlot> {
        let slot = Arc::new(SessionSlot::new(session));
        self.sessions
            .write()
            .await
            .insert(slot.id().to_string(), Arc::clone(&slot));
        slot
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Unregisters a session; later lookups fail with `SessionNotFound`.
    pub async fn remove(&self, id: &str) -> Result<Arc<SessionSlot>> {
        self.sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Ids of every live session, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxLayout;

    struct FakeSandbox {
        id: String,
        path: PathBuf,
        pristine: PathBuf,
        layout: SandboxLayout,
        cleaned: Arc<AtomicBool>,
    }

    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            &self.id
        }
        fn path(&self) -> &PathBuf {
            &self.path
        }
        fn pristine_path(&self) -> &PathBuf {
            &self.pristine
        }
        fn layout(&self) -> &SandboxLayout {
            &self.layout
        }
        fn cleanup(&mut self) -> Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session(id: &str) -> (Session, Arc<AtomicBool>) {
        let cleaned = Arc::new(AtomicBool::new(false));
        let sandbox = FakeSandbox {
            id: id.to_string(),
            path: PathBuf::from("/sandboxes").join(id).join("workspace"),
            pristine: PathBuf::from("/sandboxes").join(id).join("pristine"),
            layout: SandboxLayout::default(),
            cleaned: Arc::clone(&cleaned),
        };
        (Session::new("todo-app", Box::new(sandbox), None), cleaned)
    }

    #[test]
    fn history_is_append_only_and_ordered() {
        let (mut session, _) = session("a");
        session.record_turn("make it blue", WorkflowName::SimpleModification, Usage::new(3, 1));
        session.record_turn("change it back", WorkflowName::SimpleModification, Usage::new(2, 1));

        assert_eq!(session.history().as_slice(), ["make it blue", "change it back"]);
        assert_eq!(session.turns(), 2);
        assert_eq!(session.usage(), Usage::new(5, 2));
        assert_eq!(session.active_workflow(), Some(WorkflowName::SimpleModification));
    }

    #[test]
    fn info_reflects_session_state() {
        let (session, _) = session("abc");
        let info = session.info();

        assert_eq!(info.id, "abc");
        assert_eq!(info.project_name, "todo-app");
        assert!(info.sandbox_path.ends_with("abc/workspace"));
        assert!(info.instruction_history.is_empty());
    }

    #[tokio::test]
    async fn store_insert_get_remove() {
        let store = SessionStore::new();
        let (session, _) = session("s1");
        store.insert(session).await;

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("s1").await.unwrap().id(), "s1");

        store.remove("s1").await.unwrap();
        assert!(matches!(store.get("s1").await, Err(Error::SessionNotFound(_))));
        assert!(matches!(store.remove("s1").await, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn second_acquire_is_busy() {
        let store = SessionStore::new();
        let (session, _) = session("busy");
        let slot = store.insert(session).await;

        let guard = slot.try_acquire().unwrap();
        assert!(matches!(slot.try_acquire(), Err(Error::SessionBusy(id)) if id == "busy"));

        drop(guard);
        assert!(slot.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn release_cleans_up_sandbox() {
        let (mut session, cleaned) = session("r");
        session.release().await.unwrap();
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_flag_is_shared() {
        let store = SessionStore::new();
        let (session, _) = session("c");
        let slot = store.insert(session).await;

        assert!(!slot.is_cancelled());
        store.get("c").await.unwrap().cancel();
        assert!(slot.cancel_flag().load(Ordering::SeqCst));
    }
}
