use super::StoreAdapter;
use crate::errors::{AppError, AppResult};
use crate::models::{Fields, Record};
use serde::Serialize;

#[derive(Debug, Clone)]
pub enum BatchOp {
    Create {
        path: String,
        id: Option<String>,
        data: Fields,
    },
    Update {
        path: String,
        id: String,
        partial: Fields,
    },
    Delete {
        path: String,
        id: String,
    },
}

impl BatchOp {
    pub fn describe(&self) -> String {
        match self {
            Self::Create { path, id: Some(id), .. } => format!("create {}/{}", path, id),
            Self::Create { path, id: None, .. } => format!("create {}/<new>", path),
            Self::Update { path, id, .. } => format!("update {}/{}", path, id),
            Self::Delete { path, id } => format!("delete {}/{}", path, id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, path: &str, id: Option<&str>, data: Fields) -> &mut Self {
        self.ops.push(BatchOp::Create {
            path: path.to_string(),
            id: id.map(ToString::to_string),
            data,
        });
        self
    }

    pub fn update(&mut self, path: &str, id: &str, partial: Fields) -> &mut Self {
        self.ops.push(BatchOp::Update {
            path: path.to_string(),
            id: id.to_string(),
            partial,
        });
        self
    }

    pub fn delete(&mut self, path: &str, id: &str) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            path: path.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug)]
pub struct BatchItemResult {
    pub index: usize,
    pub op: String,
    pub outcome: AppResult<Option<Record>>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<BatchItemResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            succeeded: self.succeeded(),
            failed: self.failed(),
            failures: self.failure_messages(),
        }
    }

    pub fn into_result(self) -> AppResult<Vec<Option<Record>>> {
        if self.is_complete() {
            return self.items.into_iter().map(|item| item.outcome).collect();
        }
        Err(AppError::PartialFailure {
            succeeded: self.succeeded(),
            total: self.items.len(),
            message: self.failure_messages().join("; "),
        })
    }

    fn failure_messages(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| {
                item.outcome
                    .as_ref()
                    .err()
                    .map(|error| format!("#{} {}: {}", item.index, item.op, error))
            })
            .collect()
    }
}

pub async fn apply(store: &dyn StoreAdapter, batch: WriteBatch) -> BatchReport {
    let mut report = BatchReport::default();
    for (index, op) in batch.ops.into_iter().enumerate() {
        let description = op.describe();
        let outcome = match op {
            BatchOp::Create { path, id, data } => store.create(&path, data, id.as_deref()).await.map(Some),
            BatchOp::Update { path, id, partial } => store.update(&path, &id, partial).await.map(Some),
            BatchOp::Delete { path, id } => store.delete(&path, &id).await.map(|_| None),
        };
        if let Err(error) = &outcome {
            tracing::warn!(index, op = %description, error = %error, "batch op failed");
        }
        report.items.push(BatchItemResult {
            index,
            op: description,
            outcome,
        });
    }
    report
}
