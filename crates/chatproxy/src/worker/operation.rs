//! Dispatch operations.
//!
//! An [`Operation`] is built by a command and invoked at most once:
//! `NotStarted` moves to `Succeeded` or `Error`; anything else is terminal and
//! left untouched. `Synthetic` operations are built by the dispatcher itself
//! and never carry an action.

use async_trait::async_trait;

use super::connections::ConnectionTable;
use crate::bridge::protocol::{ConnectionId, OperationRecord, OperationStatus, RequestId};
use crate::fault::{Fault, FaultRecord};

/// What an operation sees while it runs.
pub struct CommandContext<'a> {
    pub request_id: RequestId,
    pub target: Option<ConnectionId>,
    pub connections: &'a mut ConnectionTable,
}

/// The executable part of an operation. Returns the serialized result.
#[async_trait]
pub trait Action: Send {
    async fn run(self: Box<Self>, ctx: &mut CommandContext<'_>) -> Result<String, Fault>;
}

pub struct Operation {
    name: String,
    status: OperationStatus,
    result: Option<String>,
    fault: Option<FaultRecord>,
    action: Option<Box<dyn Action>>,
}

impl Operation {
    pub fn new(name: impl Into<String>, action: impl Action + 'static) -> Self {
        Self {
            name: name.into(),
            status: OperationStatus::NotStarted,
            result: None,
            fault: None,
            action: Some(Box::new(action)),
        }
    }

    /// Terminal operation with nothing to run.
    pub fn synthetic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: OperationStatus::Synthetic,
            result: None,
            fault: None,
            action: None,
        }
    }

    /// Terminal operation that already failed, e.g. an unknown command.
    pub fn failed(name: impl Into<String>, fault: &Fault) -> Self {
        Self {
            name: name.into(),
            status: OperationStatus::Error,
            result: None,
            fault: Some(fault.record()),
            action: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }

    /// Run the action once. Errors are captured on the operation, never returned.
    pub async fn invoke(&mut self, ctx: &mut CommandContext<'_>) {
        if self.status != OperationStatus::NotStarted {
            return;
        }
        let Some(action) = self.action.take() else {
            self.status = OperationStatus::Synthetic;
            return;
        };
        match action.run(ctx).await {
            Ok(result) => {
                self.status = OperationStatus::Succeeded;
                self.result = Some(result);
            }
            Err(fault) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    operation = %self.name,
                    category = fault.category(),
                    error = %fault,
                    "Operation failed"
                );
                self.status = OperationStatus::Error;
                self.fault = Some(fault.record());
            }
        }
    }

    pub fn record(&self) -> OperationRecord {
        OperationRecord {
            name: self.name.clone(),
            status: self.status,
            result: self.result.clone(),
            fault: self.fault.clone(),
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Credentials, ServiceRegistry};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>, Result<String, Fault>);

    #[async_trait]
    impl Action for Counting {
        async fn run(self: Box<Self>, _ctx: &mut CommandContext<'_>) -> Result<String, Fault> {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1
        }
    }

    fn table() -> ConnectionTable {
        ConnectionTable::new(ServiceRegistry::new(), Credentials::default())
    }

    #[tokio::test]
    async fn invoke_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut op = Operation::new("op", Counting(Arc::clone(&runs), Ok("done".into())));
        let mut table = table();
        let mut ctx = CommandContext {
            request_id: RequestId::new(),
            target: None,
            connections: &mut table,
        };

        op.invoke(&mut ctx).await;
        op.invoke(&mut ctx).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(op.status(), OperationStatus::Succeeded);
        assert_eq!(op.result(), Some("done"));
    }

    #[tokio::test]
    async fn failure_is_captured() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut op = Operation::new("op", Counting(runs, Err(Fault::service("backend down"))));
        let mut table = table();
        let mut ctx = CommandContext {
            request_id: RequestId::new(),
            target: None,
            connections: &mut table,
        };

        op.invoke(&mut ctx).await;

        assert_eq!(op.status(), OperationStatus::Error);
        assert_eq!(op.fault().unwrap().message, "backend down");
        assert!(op.result().is_none());
    }

    #[tokio::test]
    async fn synthetic_is_immutable() {
        let mut op = Operation::synthetic("exit");
        let mut table = table();
        let mut ctx = CommandContext {
            request_id: RequestId::new(),
            target: None,
            connections: &mut table,
        };

        op.invoke(&mut ctx).await;

        assert_eq!(op.status(), OperationStatus::Synthetic);
        assert!(op.status().is_terminal());
    }

    #[test]
    fn record_of_unexecuted_operation_is_not_started() {
        let op = Operation::new("send-chat", Counting(Arc::new(AtomicUsize::new(0)), Ok(String::new())));
        let record = op.record();
        assert_eq!(record.status, OperationStatus::NotStarted);
        assert!(record.result.is_none() && record.fault.is_none());
    }
}
