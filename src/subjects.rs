use crate::models::SubjectType;
use crate::repository::{Document, Entity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallmentStatus {
    Pending,
    Partial,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    pub customer_name: String,
    pub amount: f64,
    pub due_date: DateTime<Utc>,
    pub status: InstallmentStatus,
}

impl Entity for Installment {
    const COLLECTION: &'static str = "installments";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Scheduled,
    InTransit,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Entity for Delivery {
    const COLLECTION: &'static str = "deliveries";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComplaintStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complaint {
    pub customer_name: String,
    pub summary: String,
    pub follow_up_at: DateTime<Utc>,
    pub status: ComplaintStatus,
}

impl Entity for Complaint {
    const COLLECTION: &'static str = "complaints";
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    Installment(Document<Installment>),
    Delivery(Document<Delivery>),
    Complaint(Document<Complaint>),
}

impl Subject {
    pub fn subject_type(&self) -> SubjectType {
        match self {
            Self::Installment(_) => SubjectType::Installment,
            Self::Delivery(_) => SubjectType::Delivery,
            Self::Complaint(_) => SubjectType::Complaint,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Installment(doc) => &doc.id,
            Self::Delivery(doc) => &doc.id,
            Self::Complaint(doc) => &doc.id,
        }
    }

    pub fn due_at(&self) -> DateTime<Utc> {
        match self {
            Self::Installment(doc) => doc.data.due_date,
            Self::Delivery(doc) => doc.data.scheduled_at,
            Self::Complaint(doc) => doc.data.follow_up_at,
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Installment(doc) => matches!(doc.data.status, InstallmentStatus::Paid | InstallmentStatus::Cancelled),
            Self::Delivery(doc) => matches!(doc.data.status, DeliveryStatus::Delivered | DeliveryStatus::Cancelled),
            Self::Complaint(doc) => matches!(doc.data.status, ComplaintStatus::Resolved | ComplaintStatus::Closed),
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::Installment(doc) => format!("Installment from {}", doc.data.customer_name),
            Self::Delivery(doc) => format!("Delivery to {}", doc.data.customer_name),
            Self::Complaint(doc) => format!("Complaint follow-up: {}", doc.data.customer_name),
        }
    }

    pub fn message(&self, label: &str) -> String {
        match self {
            Self::Installment(doc) => format!("{:.2} due: {}", doc.data.amount, label),
            Self::Delivery(doc) => match &doc.data.address {
                Some(address) => format!("Delivery to {}: {}", address, label),
                None => format!("Delivery scheduled: {}", label),
            },
            Self::Complaint(doc) => format!("{}: {}", doc.data.summary, label),
        }
    }
}

impl From<Document<Installment>> for Subject {
    fn from(value: Document<Installment>) -> Self {
        Self::Installment(value)
    }
}

impl From<Document<Delivery>> for Subject {
    fn from(value: Document<Delivery>) -> Self {
        Self::Delivery(value)
    }
}

impl From<Document<Complaint>> for Subject {
    fn from(value: Document<Complaint>) -> Self {
        Self::Complaint(value)
    }
}
