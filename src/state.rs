// ===============================
// src/state.rs
// ===============================
//
// AppState = satu-satunya state yang di-persist:
// - processed_signal_ids : id sinyal yang sudah diproses (urut sisip, tidak pernah dipangkas)
// - pending_orders       : order yang sudah dikirim tapi belum direkonsiliasi
//
// Semua mutasi lewat PersistentState, yang langsung menulis ulang file (atomic
// tmp + rename) setelah setiap perubahan.
//
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::PendingOrder;
use crate::error::StateError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub processed_signal_ids: Vec<String>,
    pub pending_orders: Vec<PendingOrder>,
}

impl AppState {
    pub fn is_processed(&self, id: &str) -> bool { self.processed_signal_ids.iter().any(|x| x == id) }

    pub fn pending_for<'a>(&'a self, pair: &'a str) -> impl Iterator<Item = &'a PendingOrder> + 'a {
        self.pending_orders.iter().filter(move |p| p.pair == pair)
    }
}

/// Persistence port for AppState.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<AppState>, StateError>;
    fn save(&self, state: &AppState) -> Result<(), StateError>;
}

/// JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<AppState>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        // Corrupt file is fatal: trading on unknown state is worse than halting.
        let state: AppState = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }

    fn save(&self, state: &AppState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.tmp_path();
        {
            let file = File::create(&tmp)?;
            let mut w = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut w, state)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), pending = state.pending_orders.len(), "state saved");
        Ok(())
    }
}

/// In-memory store; the shared slot lets callers inspect what was saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<AppState>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn saved(&self) -> Option<AppState> { self.slot.lock().ok().and_then(|g| g.clone()) }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<AppState>, StateError> { Ok(self.saved()) }

    fn save(&self, state: &AppState) -> Result<(), StateError> {
        if let Ok(mut g) = self.slot.lock() {
            *g = Some(state.clone());
        }
        Ok(())
    }
}

/// AppState bound to its store. Every mutator persists before returning.
pub struct PersistentState {
    state: AppState,
    store: Box<dyn StateStore>,
}

impl PersistentState {
    /// Loads state, or initializes and persists an empty one when absent.
    pub fn open(store: Box<dyn StateStore>) -> Result<Self, StateError> {
        let state = match store.load()? {
            Some(s) => {
                info!(processed = s.processed_signal_ids.len(), pending = s.pending_orders.len(), "state loaded");
                s
            }
            None => {
                info!("no state found, starting fresh");
                let s = AppState::default();
                store.save(&s)?;
                s
            }
        };
        Ok(Self { state, store })
    }

    pub fn get(&self) -> &AppState { &self.state }

    /// Records `id`; returns false (and writes nothing) when already present.
    pub fn mark_processed(&mut self, id: &str) -> Result<bool, StateError> {
        if self.state.is_processed(id) {
            return Ok(false);
        }
        self.state.processed_signal_ids.push(id.to_string());
        self.store.save(&self.state)?;
        Ok(true)
    }

    pub fn add_pending(&mut self, order: PendingOrder) -> Result<(), StateError> {
        self.state.pending_orders.push(order);
        self.store.save(&self.state)
    }

    pub fn remove_pending(&mut self, txid: &str) -> Result<Option<PendingOrder>, StateError> {
        let Some(idx) = self.state.pending_orders.iter().position(|p| p.txid == txid) else {
            return Ok(None);
        };
        let removed = self.state.pending_orders.remove(idx);
        self.store.save(&self.state)?;
        Ok(Some(removed))
    }

    /// Removes every order in `txids` with a single write.
    pub fn remove_many(&mut self, txids: &[String]) -> Result<usize, StateError> {
        let before = self.state.pending_orders.len();
        self.state.pending_orders.retain(|p| !txids.contains(&p.txid));
        let removed = before - self.state.pending_orders.len();
        self.store.save(&self.state)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use chrono::Utc;

    fn order(txid: &str) -> PendingOrder {
        PendingOrder { txid: txid.into(), pair: "ETH/BTC".into(), side: Side::Buy, requested_volume: 10.0, created_at: Utc::now() }
    }

    #[test]
    fn missing_file_initializes_and_persists_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.data");
        let st = PersistentState::open(Box::new(JsonFileStore::new(&path))).unwrap();
        assert_eq!(st.get(), &AppState::default());
        assert!(path.exists());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.data");
        {
            let mut st = PersistentState::open(Box::new(JsonFileStore::new(&path))).unwrap();
            st.mark_processed("s1").unwrap();
            st.add_pending(order("O1")).unwrap();
        }
        let st = PersistentState::open(Box::new(JsonFileStore::new(&path))).unwrap();
        assert!(st.get().is_processed("s1"));
        assert_eq!(st.get().pending_orders.len(), 1);
        assert_eq!(st.get().pending_orders[0].txid, "O1");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.data");
        fs::write(&path, "{not json").unwrap();
        let res = PersistentState::open(Box::new(JsonFileStore::new(&path)));
        assert!(matches!(res, Err(StateError::Corrupt(_))));
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let store = MemoryStore::new();
        let mut st = PersistentState::open(Box::new(store.clone())).unwrap();
        assert!(st.mark_processed("a").unwrap());
        assert!(!st.mark_processed("a").unwrap());
        assert!(st.mark_processed("b").unwrap());
        assert_eq!(store.saved().unwrap().processed_signal_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn remove_pending_persists() {
        let store = MemoryStore::new();
        let mut st = PersistentState::open(Box::new(store.clone())).unwrap();
        st.add_pending(order("O1")).unwrap();
        st.add_pending(order("O2")).unwrap();
        assert!(st.remove_pending("O1").unwrap().is_some());
        assert!(st.remove_pending("nope").unwrap().is_none());
        let saved = store.saved().unwrap();
        assert_eq!(saved.pending_orders.len(), 1);
        assert_eq!(saved.pending_orders[0].txid, "O2");
    }
}
