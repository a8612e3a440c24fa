//! Agent registry (C4): materializes fully-bound agent handles from
//! configuration.
//!
//! Personas are read eagerly at registry construction; a missing persona is a
//! fatal, pre-run error. The tool-server subset and the output schema are
//! part of the binding, enforced by the registry, not by the persona text: an
//! agent cannot call a server it was not granted, and changing its schema is
//! a configuration change.
//!
//! The registry is stateless across invocations (the client pool is the only
//! shared cache); a handle can be invoked concurrently from independent runs.

mod invoke;

pub use invoke::InvokeContext;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{AgentSpec, RuntimeConfig};
use crate::llm::LlmProvider;
use crate::mcp::ClientPool;
use crate::schema::{RecordSchema, SchemaError, SchemaRegistry};

/// Fatal, pre-run registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("persona for agent {agent_key} unreadable at {path}: {source}")]
    PersonaLoad {
        agent_key: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// One agent's full binding: spec, loaded persona, resolved schema.
pub(crate) struct AgentBinding {
    pub(crate) spec: AgentSpec,
    pub(crate) persona: String,
    pub(crate) schema: Arc<RecordSchema>,
}

/// Produces [`AgentHandle`]s from agent keys.
pub struct AgentRegistry {
    bindings: BTreeMap<String, Arc<AgentBinding>>,
    pool: Arc<ClientPool>,
    provider: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistry {
    /// Builds bindings for every declared agent: loads personas from
    /// `persona_root` (the config document's directory) and resolves output
    /// schemas against the closed registry.
    pub fn new(
        config: &RuntimeConfig,
        schemas: &SchemaRegistry,
        pool: Arc<ClientPool>,
        provider: Arc<dyn LlmProvider>,
        persona_root: &Path,
    ) -> Result<Self, RegistryError> {
        let mut bindings = BTreeMap::new();
        for (key, spec) in &config.agents {
            let path = persona_root.join(&spec.persona_source);
            let persona =
                std::fs::read_to_string(&path).map_err(|source| RegistryError::PersonaLoad {
                    agent_key: key.clone(),
                    path: path.clone(),
                    source,
                })?;
            let schema = schemas.get(&spec.output_schema)?;
            bindings.insert(
                key.clone(),
                Arc::new(AgentBinding {
                    spec: spec.clone(),
                    persona,
                    schema,
                }),
            );
        }
        Ok(Self {
            bindings,
            pool,
            provider,
        })
    }

    pub fn handle(&self, agent_key: &str) -> Result<AgentHandle, RegistryError> {
        let binding = self
            .bindings
            .get(agent_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAgent(agent_key.to_string()))?;
        Ok(AgentHandle {
            binding,
            pool: Arc::clone(&self.pool),
            provider: Arc::clone(&self.provider),
        })
    }
}

/// A fully-bound agent. `invoke` issues one logical LLM call (with a bounded
/// tool-round loop and the retry policy applied) and always returns an
/// assessment record; failures are data, not errors.
pub struct AgentHandle {
    binding: Arc<AgentBinding>,
    pool: Arc<ClientPool>,
    provider: Arc<dyn LlmProvider>,
}

impl AgentHandle {
    pub fn agent_key(&self) -> &str {
        &self.binding.spec.key
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.binding.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;

    const CONFIG: &str = r#"
agents:
  intake:
    display_name: "Intake"
    persona_source: intake.md
    model_id: test-model
    output_schema: intake_assessment
    timeout_seconds: 30
"#;

    fn build(persona_dir: &Path) -> Result<AgentRegistry, RegistryError> {
        let config = RuntimeConfig::from_yaml_str(CONFIG).unwrap();
        let schemas = SchemaRegistry::builtin();
        AgentRegistry::new(
            &config,
            &schemas,
            Arc::new(ClientPool::new(Vec::new())),
            Arc::new(ScriptedProvider::new()),
            persona_dir,
        )
    }

    #[test]
    fn registry_loads_personas_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intake.md"), "You are the intake agent.").unwrap();
        let registry = build(dir.path()).unwrap();
        let handle = registry.handle("intake").unwrap();
        assert_eq!(handle.agent_key(), "intake");
    }

    /// **Scenario**: a missing persona fails registry construction, not
    /// invocation.
    #[test]
    fn missing_persona_is_fatal_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = build(dir.path()).unwrap_err();
        assert!(matches!(err, RegistryError::PersonaLoad { agent_key, .. } if agent_key == "intake"));
    }

    #[test]
    fn unknown_schema_is_fatal_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intake.md"), "persona").unwrap();
        let config_yaml = CONFIG.replace("intake_assessment", "no_such_schema");
        let config = RuntimeConfig::from_yaml_str(&config_yaml).unwrap();
        let err = AgentRegistry::new(
            &config,
            &SchemaRegistry::builtin(),
            Arc::new(ClientPool::new(Vec::new())),
            Arc::new(ScriptedProvider::new()),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Schema(SchemaError::Unknown(_))));
    }

    #[test]
    fn unknown_agent_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intake.md"), "persona").unwrap();
        let registry = build(dir.path()).unwrap();
        assert!(matches!(
            registry.handle("credit"),
            Err(RegistryError::UnknownAgent(_))
        ));
    }
}
