//! Seams to the collaborators the engine calls but does not own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::domain::lead::{Lead, LeadId};
use crate::dossier::Dossier;
use crate::errors::ApplicationError;
use crate::scheduler::TouchInstruction;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("lead store unavailable: {0}")]
    Store(String),
    #[error("touch delivery failed: {0}")]
    Delivery(String),
    #[error("human notification failed: {0}")]
    Notification(String),
}

impl From<CollaboratorError> for ApplicationError {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::Store(message) => Self::Persistence(message),
            other => Self::Integration(other.to_string()),
        }
    }
}

/// Key-value lead storage. Callers dedupe by email through `find_by_email`.
pub trait LeadStore: Send + Sync {
    fn find_by_email(&self, email: &str) -> Result<Option<Lead>, CollaboratorError>;
    fn get(&self, id: &LeadId) -> Result<Option<Lead>, CollaboratorError>;
    fn create(&self, lead: Lead) -> Result<(), CollaboratorError>;
    fn update(&self, lead: Lead) -> Result<(), CollaboratorError>;
}

/// Accepts "send touch" work items. Delivery outcome is reported elsewhere.
pub trait DeliveryDispatcher: Send + Sync {
    fn dispatch(&self, touch: &TouchInstruction) -> Result<(), CollaboratorError>;
}

/// Receives finished dossiers for a human to act on.
pub trait HumanNotifier: Send + Sync {
    fn notify(&self, lead: &Lead, dossier: &Dossier) -> Result<(), CollaboratorError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLeadStore {
    leads: Arc<Mutex<HashMap<LeadId, Lead>>>,
}

impl InMemoryLeadStore {
    pub fn with_leads(leads: impl IntoIterator<Item = Lead>) -> Self {
        let store = Self::default();
        lock(&store.leads).extend(leads.into_iter().map(|lead| (lead.id.clone(), lead)));
        store
    }

    pub fn snapshot(&self) -> Vec<Lead> {
        let mut leads: Vec<Lead> = lock(&self.leads).values().cloned().collect();
        leads.sort_by(|a, b| a.id.cmp(&b.id));
        leads
    }
}

impl LeadStore for InMemoryLeadStore {
    fn find_by_email(&self, email: &str) -> Result<Option<Lead>, CollaboratorError> {
        let email = email.trim().to_ascii_lowercase();
        Ok(lock(&self.leads).values().find(|lead| lead.email.as_deref() == Some(email.as_str())).cloned())
    }

    fn get(&self, id: &LeadId) -> Result<Option<Lead>, CollaboratorError> {
        Ok(lock(&self.leads).get(id).cloned())
    }

    fn create(&self, lead: Lead) -> Result<(), CollaboratorError> {
        let mut leads = lock(&self.leads);
        if leads.contains_key(&lead.id) {
            return Err(CollaboratorError::Store(format!("lead {} already exists", lead.id.0)));
        }
        leads.insert(lead.id.clone(), lead);
        Ok(())
    }

    fn update(&self, lead: Lead) -> Result<(), CollaboratorError> {
        let mut leads = lock(&self.leads);
        if !leads.contains_key(&lead.id) {
            return Err(CollaboratorError::Store(format!("lead {} does not exist", lead.id.0)));
        }
        leads.insert(lead.id.clone(), lead);
        Ok(())
    }
}

/// Records dispatched touches; can be told to fail to exercise retry paths.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<TouchInstruction>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<TouchInstruction> {
        lock(&self.sent).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }
}

impl DeliveryDispatcher for RecordingDispatcher {
    fn dispatch(&self, touch: &TouchInstruction) -> Result<(), CollaboratorError> {
        if *lock(&self.failing) {
            return Err(CollaboratorError::Delivery(format!(
                "channel {} rejected touch for {}",
                touch.channel.as_str(),
                touch.enrollment_id.0
            )));
        }
        lock(&self.sent).push(touch.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    delivered: Arc<Mutex<Vec<Dossier>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn delivered(&self) -> Vec<Dossier> {
        lock(&self.delivered).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }
}

impl HumanNotifier for RecordingNotifier {
    fn notify(&self, lead: &Lead, dossier: &Dossier) -> Result<(), CollaboratorError> {
        if *lock(&self.failing) {
            return Err(CollaboratorError::Notification(format!(
                "no recipient acknowledged the dossier for {}",
                lead.id.0
            )));
        }
        lock(&self.delivered).push(dossier.clone());
        Ok(())
    }
}
