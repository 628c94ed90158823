//! Spreadsheet mirror access. The mirror is a secondary, human-editable view
//! of bookings: reads feed conflict checks and reconciliation, writes are
//! best-effort. Nothing here participates in transaction arbitration.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use bookline_core::config::MirrorConfig;
use bookline_core::errors::MirrorSyncError;

/// One occupied slot as the mirror sees it, addressed by position rather than
/// by booking id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorSlot {
    pub project_id: String,
    pub specialist: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub service: Option<String>,
}

#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Occupied slots for one specialist's day.
    async fn occupied_slots(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
    ) -> Result<Vec<MirrorSlot>, MirrorSyncError>;

    /// Writes client fields into one slot cell, overwriting any occupant.
    async fn set_slot(&self, slot: &MirrorSlot) -> Result<(), MirrorSyncError>;

    /// Empties one slot cell.
    async fn clear_slot(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<(), MirrorSyncError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotPayload {
    specialist: String,
    date: String,
    time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service: Option<String>,
}

/// HTTP client for the spreadsheet bridge service.
pub struct HttpMirrorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpMirrorStore {
    pub fn from_config(config: &MirrorConfig) -> Result<Self, MirrorSyncError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| MirrorSyncError("mirror base_url is not configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| MirrorSyncError(format!("failed to build http client: {error}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn slots_url(&self, project_id: &str) -> String {
        format!("{}/v1/projects/{project_id}/slots", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.expose_secret()),
            None => request,
        }
    }
}

fn http_err(context: &str, error: reqwest::Error) -> MirrorSyncError {
    MirrorSyncError(format!("{context}: {error}"))
}

#[async_trait]
impl MirrorStore for HttpMirrorStore {
    async fn occupied_slots(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
    ) -> Result<Vec<MirrorSlot>, MirrorSyncError> {
        let date_param = date.format("%Y-%m-%d").to_string();
        let request = self
            .client
            .get(self.slots_url(project_id))
            .query(&[("specialist", specialist), ("date", date_param.as_str())]);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| http_err("mirror read failed", error))?
            .error_for_status()
            .map_err(|error| http_err("mirror read rejected", error))?;

        let payloads: Vec<SlotPayload> = response
            .json()
            .await
            .map_err(|error| http_err("mirror read returned malformed body", error))?;

        payloads
            .into_iter()
            .map(|payload| {
                let date = NaiveDate::parse_from_str(&payload.date, "%Y-%m-%d").map_err(|_| {
                    MirrorSyncError(format!("mirror returned malformed date `{}`", payload.date))
                })?;
                let time = NaiveTime::parse_from_str(&payload.time, "%H:%M").map_err(|_| {
                    MirrorSyncError(format!("mirror returned malformed time `{}`", payload.time))
                })?;
                Ok(MirrorSlot {
                    project_id: project_id.to_string(),
                    specialist: payload.specialist,
                    date,
                    time,
                    client_id: payload.client_id,
                    client_name: payload.client_name,
                    service: payload.service,
                })
            })
            .collect()
    }

    async fn set_slot(&self, slot: &MirrorSlot) -> Result<(), MirrorSyncError> {
        let payload = SlotPayload {
            specialist: slot.specialist.clone(),
            date: slot.date.format("%Y-%m-%d").to_string(),
            time: slot.time.format("%H:%M").to_string(),
            client_id: slot.client_id.clone(),
            client_name: slot.client_name.clone(),
            service: slot.service.clone(),
        };
        let request = self.client.put(self.slots_url(&slot.project_id)).json(&payload);
        self.authorize(request)
            .send()
            .await
            .map_err(|error| http_err("mirror write failed", error))?
            .error_for_status()
            .map_err(|error| http_err("mirror write rejected", error))?;

        Ok(())
    }

    async fn clear_slot(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<(), MirrorSyncError> {
        let date_param = date.format("%Y-%m-%d").to_string();
        let time_param = time.format("%H:%M").to_string();
        let request = self.client.delete(self.slots_url(project_id)).query(&[
            ("specialist", specialist),
            ("date", date_param.as_str()),
            ("time", time_param.as_str()),
        ]);
        self.authorize(request)
            .send()
            .await
            .map_err(|error| http_err("mirror clear failed", error))?
            .error_for_status()
            .map_err(|error| http_err("mirror clear rejected", error))?;

        Ok(())
    }
}

/// Stand-in used when the mirror is disabled: reads see an empty sheet,
/// writes succeed without effect.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMirrorStore;

#[async_trait]
impl MirrorStore for NoopMirrorStore {
    async fn occupied_slots(
        &self,
        _project_id: &str,
        _specialist: &str,
        _date: NaiveDate,
    ) -> Result<Vec<MirrorSlot>, MirrorSyncError> {
        Ok(Vec::new())
    }

    async fn set_slot(&self, _slot: &MirrorSlot) -> Result<(), MirrorSyncError> {
        Ok(())
    }

    async fn clear_slot(
        &self,
        _project_id: &str,
        _specialist: &str,
        _date: NaiveDate,
        _time: NaiveTime,
    ) -> Result<(), MirrorSyncError> {
        Ok(())
    }
}

type SlotKey = (String, String, NaiveDate, NaiveTime);

/// In-process mirror with failure injection. Backs the engine tests and small
/// single-process deployments that want mirror semantics without a network.
#[derive(Default)]
pub struct InMemoryMirrorStore {
    slots: Mutex<BTreeMap<SlotKey, MirrorSlot>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn seed(&self, slot: MirrorSlot) {
        let key =
            (slot.project_id.clone(), slot.specialist.clone(), slot.date, slot.time);
        self.slots.lock().expect("mirror slots lock").insert(key, slot);
    }

    pub fn slot(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Option<MirrorSlot> {
        let key = (project_id.to_string(), specialist.to_string(), date, time);
        self.slots.lock().expect("mirror slots lock").get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("mirror slots lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MirrorStore for InMemoryMirrorStore {
    async fn occupied_slots(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
    ) -> Result<Vec<MirrorSlot>, MirrorSyncError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MirrorSyncError("simulated mirror read failure".to_string()));
        }
        let slots = self.slots.lock().expect("mirror slots lock");
        Ok(slots
            .values()
            .filter(|slot| {
                slot.project_id == project_id && slot.specialist == specialist && slot.date == date
            })
            .cloned()
            .collect())
    }

    async fn set_slot(&self, slot: &MirrorSlot) -> Result<(), MirrorSyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MirrorSyncError("simulated mirror write failure".to_string()));
        }
        self.seed(slot.clone());
        Ok(())
    }

    async fn clear_slot(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<(), MirrorSyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MirrorSyncError("simulated mirror write failure".to_string()));
        }
        let key = (project_id.to_string(), specialist.to_string(), date, time);
        self.slots.lock().expect("mirror slots lock").remove(&key);
        Ok(())
    }
}
