use std::collections::HashMap;

use tokio::sync::RwLock;

use cadence_core::domain::conversation::ConversationMessage;
use cadence_core::domain::enrollment::{Enrollment, EnrollmentId};
use cadence_core::domain::lead::{Lead, LeadId};

use super::{ConversationRepository, EnrollmentRepository, LeadRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryLeadRepository {
    leads: RwLock<HashMap<String, Lead>>,
}

#[async_trait::async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        Ok(leads.get(&id.0).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, RepositoryError> {
        let email = email.trim().to_ascii_lowercase();
        let leads = self.leads.read().await;
        Ok(leads.values().find(|lead| lead.email.as_deref() == Some(email.as_str())).cloned())
    }

    async fn list(&self) -> Result<Vec<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        let mut all: Vec<Lead> = leads.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        let mut leads = self.leads.write().await;
        leads.insert(lead.id.0.clone(), lead);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEnrollmentRepository {
    enrollments: RwLock<HashMap<String, Enrollment>>,
}

#[async_trait::async_trait]
impl EnrollmentRepository for InMemoryEnrollmentRepository {
    async fn find_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
        let enrollments = self.enrollments.read().await;
        Ok(enrollments.get(&id.0).cloned())
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Enrollment>, RepositoryError> {
        Ok(self.list().await?.into_iter().filter(|enrollment| &enrollment.lead_id == lead_id).collect())
    }

    async fn list(&self) -> Result<Vec<Enrollment>, RepositoryError> {
        let enrollments = self.enrollments.read().await;
        let mut all: Vec<Enrollment> = enrollments.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn save(&self, enrollment: Enrollment) -> Result<(), RepositoryError> {
        let mut enrollments = self.enrollments.write().await;
        enrollments.insert(enrollment.id.0.clone(), enrollment);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    messages: RwLock<Vec<ConversationMessage>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn append(&self, message: ConversationMessage) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        let position = messages.partition_point(|existing| existing.sent_at <= message.sent_at);
        messages.insert(position, message);
        Ok(())
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.iter().filter(|message| &message.lead_id == lead_id).cloned().collect())
    }

    async fn list(&self) -> Result<Vec<ConversationMessage>, RepositoryError> {
        Ok(self.messages.read().await.clone())
    }
}
