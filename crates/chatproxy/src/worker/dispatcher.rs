//! Command dispatcher.
//!
//! Turns one request into a response. Nothing raised while building or
//! running operations escapes `invoke`: every failure ends up as a fault
//! record on the response. The only error `invoke` returns is the
//! InvalidState fault once `exit` has been processed.

use super::commands::CommandTable;
use super::connections::ConnectionTable;
use super::operation::{CommandContext, Operation};
use crate::bridge::protocol::{
    ConnectionId, EXIT, RequestId, Response, ResponseBody, ResponseStatus,
};
use crate::fault::{Fault, FaultRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Ready,
    Exited,
}

pub struct Dispatcher {
    commands: CommandTable,
    connections: ConnectionTable,
    state: RunState,
}

impl Dispatcher {
    pub fn new(commands: CommandTable, connections: ConnectionTable) -> Self {
        Self {
            commands,
            connections,
            state: RunState::Ready,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub async fn invoke(
        &mut self,
        request_id: RequestId,
        command_name: &str,
        payload: &str,
        target: Option<ConnectionId>,
        what_if: bool,
    ) -> Result<Response, Fault> {
        if self.state == RunState::Exited {
            return Err(Fault::invalid_state(format!(
                "dispatcher has exited; cannot run {command_name}"
            ))
            .with_property("commandName", command_name));
        }

        let mut operations = self.build(command_name, payload);

        if what_if {
            tracing::debug!(%request_id, command = command_name, "Planning without execution");
            let faults: Vec<_> = operations.iter().filter_map(|op| op.fault().cloned()).collect();
            return Ok(Response {
                request_id,
                status: status_for(&faults),
                body: ResponseBody::WhatIf(operations.iter().map(Operation::record).collect()),
                faults,
            });
        }

        if command_name == EXIT {
            tracing::info!(%request_id, "Exit requested");
            self.state = RunState::Exited;
        }

        let mut ctx = CommandContext {
            request_id,
            target,
            connections: &mut self.connections,
        };
        for op in &mut operations {
            op.invoke(&mut ctx).await;
        }

        let mut content = Vec::new();
        let mut faults = Vec::new();
        for op in &operations {
            if let Some(result) = op.result() {
                content.push(result.to_string());
            }
            if let Some(fault) = op.fault() {
                faults.push(fault.clone());
            }
        }

        Ok(Response {
            request_id,
            status: status_for(&faults),
            body: ResponseBody::Normal(content),
            faults,
        })
    }

    fn build(&self, command_name: &str, payload: &str) -> Vec<Operation> {
        let Some(constructor) = self.commands.get(command_name) else {
            tracing::warn!(command = command_name, "Unknown command");
            let fault = Fault::protocol(format!("unknown command: {command_name}"))
                .with_property("commandName", command_name);
            return vec![Operation::failed(command_name, &fault)];
        };
        match constructor(payload) {
            Ok(operations) => operations,
            Err(fault) => {
                tracing::debug!(command = command_name, error = %fault, "Failed to build command");
                vec![Operation::failed(command_name, &fault)]
            }
        }
    }
}

fn status_for(faults: &[FaultRecord]) -> ResponseStatus {
    if faults.is_empty() {
        ResponseStatus::Success
    } else {
        ResponseStatus::Error
    }
}
