//! Connection table: connection id → bound chat service.
//!
//! Owned by the worker's single dispatch task, so no locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::protocol::ConnectionId;
use crate::fault::Fault;
use crate::service::{ChatService, Credentials, ServiceRegistry};

/// Option keys that would smuggle a secret through the configuration payload.
const SECRET_KEYS: &[&str] = &["apikey", "api_key", "api-key", "key"];

/// Service used when create-connection names no service id.
#[derive(Debug, Clone)]
pub struct DefaultService {
    pub service_id: String,
    pub options: serde_json::Value,
}

pub struct Connection {
    id: ConnectionId,
    service_id: String,
    service: Arc<dyn ChatService>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn service(&self) -> Arc<dyn ChatService> {
        Arc::clone(&self.service)
    }
}

pub struct ConnectionTable {
    registry: ServiceRegistry,
    credentials: Credentials,
    default_service: Option<DefaultService>,
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionTable {
    pub fn new(registry: ServiceRegistry, credentials: Credentials) -> Self {
        Self {
            registry,
            credentials,
            default_service: None,
            connections: HashMap::new(),
        }
    }

    pub fn with_default_service(mut self, default_service: Option<DefaultService>) -> Self {
        self.default_service = default_service;
        self
    }

    /// Build a service and store it under a fresh id.
    pub fn create(&mut self, service_id: &str, options: &serde_json::Value) -> Result<&Connection, Fault> {
        let (service_id, options) = self.resolve(service_id, options)?;
        validate_options(&options)?;

        let service = self.registry.build(&service_id, &options, &self.credentials)?;
        let id = ConnectionId::new();
        tracing::info!(connection_id = %id, %service_id, "Connection created");

        let connection = Connection {
            id,
            service_id,
            service,
        };
        Ok(self.connections.entry(id).or_insert(connection))
    }

    /// Look up a connection; a miss is a tagged bad-connection fault.
    pub fn get(&self, id: Option<ConnectionId>) -> Result<&Connection, Fault> {
        id.and_then(|id| self.connections.get(&id))
            .ok_or_else(|| Fault::bad_connection(id))
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            tracing::info!(connection_id = %id, "Connection removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn resolve(&self, service_id: &str, options: &serde_json::Value) -> Result<(String, serde_json::Value), Fault> {
        if !service_id.trim().is_empty() {
            return Ok((service_id.to_string(), options.clone()));
        }
        let default = self
            .default_service
            .as_ref()
            .ok_or_else(|| Fault::configuration("serviceId is required (no default service configured)"))?;
        let options = if options.is_null() {
            default.options.clone()
        } else {
            options.clone()
        };
        Ok((default.service_id.clone(), options))
    }
}

fn validate_options(options: &serde_json::Value) -> Result<(), Fault> {
    let map = match options {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => return Err(Fault::configuration("connection options are missing")),
        _ => return Err(Fault::configuration("connection options must be a JSON object")),
    };
    if let Some(key) = map
        .keys()
        .find(|k| SECRET_KEYS.contains(&k.to_ascii_lowercase().as_str()))
    {
        return Err(Fault::configuration(format!(
            "option '{key}' is not accepted; supply the API key through {}",
            crate::service::API_KEY_ENV
        ))
        .with_property("field", key.as_str()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> ConnectionTable {
        ConnectionTable::new(ServiceRegistry::with_builtin(), Credentials::default())
    }

    #[test]
    fn create_then_get() {
        let mut table = table();
        let id = table.create("echo", &json!({"model": "m"})).unwrap().id();
        let conn = table.get(Some(id)).unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(conn.service_id(), "echo");
        assert_eq!(conn.service().current_options(), json!({"model": "m"}));
    }

    #[test]
    fn ids_are_unique() {
        let mut table = table();
        let a = table.create("echo", &json!({})).unwrap().id();
        let b = table.create("echo", &json!({})).unwrap().id();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn missing_id_is_bad_connection() {
        let table = table();
        let err = table.get(Some(ConnectionId::new())).err().unwrap();
        assert!(err.is_bad_connection());
        let err = table.get(None).err().unwrap();
        assert!(err.is_bad_connection());
    }

    #[test]
    fn removed_connection_is_bad_connection() {
        let mut table = table();
        let id = table.create("echo", &json!({})).unwrap().id();
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.get(Some(id)).err().unwrap().is_bad_connection());
        assert!(table.is_empty());
    }

    #[test]
    fn missing_options_are_configuration_fault() {
        let mut table = table();
        let err = table.create("echo", &serde_json::Value::Null).err().unwrap();
        assert_eq!(err.category(), "ConfigurationFault");
    }

    #[test]
    fn secret_in_options_is_rejected() {
        let mut table = table();
        let err = table.create("echo", &json!({"ApiKey": "sk-123"})).err().unwrap();
        assert_eq!(err.category(), "ConfigurationFault");
        assert!(err.message().contains("CHATPROXY_API_KEY"));
        assert!(!err.message().contains("sk-123"));
        assert!(table.is_empty());
    }

    #[test]
    fn empty_service_id_uses_default() {
        let mut table = table().with_default_service(Some(DefaultService {
            service_id: "echo".to_string(),
            options: json!({"model": "default-model"}),
        }));
        let conn = table.create("", &serde_json::Value::Null).unwrap();
        assert_eq!(conn.service().current_options(), json!({"model": "default-model"}));
    }

    #[test]
    fn empty_service_id_without_default_fails() {
        let mut table = table();
        let err = table.create(" ", &json!({})).err().unwrap();
        assert_eq!(err.category(), "ConfigurationFault");
    }
}
