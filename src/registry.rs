//! Registered per-frame computations
//!
//! Every computation is registered with a unique name, a fixed argument list
//! and a result schema. The schema is either declared up front, inferred by
//! probing one frame, or left pending until the engine probes the first
//! frame of the run.

use crate::buffer::ResultBuffer;
use crate::error::{ProbeError, RegistryError, TrajparError};
use crate::schema::{self, ResultSchema, Value};
use crate::trajectory::Frame;
use std::path::Path;
use tracing::debug;

/// Name given to computations registered without one
pub const DEFAULT_NAME: &str = "Function";

/// Error type computations may return
pub type ComputeError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of a single per-frame call
pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

/// A function evaluated once per frame
///
/// Each worker runs its own fork, so stateful computations (running
/// averages, multi-frame windows) start fresh on every worker and rely on
/// the warm-up frames to rebuild their state.
pub trait Computation: Send + 'static {
    fn compute(&mut self, frame: &Frame, args: &[Value]) -> ComputeResult<Value>;

    /// Fresh copy for another worker
    fn fork(&self) -> Box<dyn Computation>;
}

impl<F> Computation for F
where
    F: FnMut(&Frame, &[Value]) -> ComputeResult<Value> + Clone + Send + 'static,
{
    fn compute(&mut self, frame: &Frame, args: &[Value]) -> ComputeResult<Value> {
        self(frame, args)
    }

    fn fork(&self) -> Box<dyn Computation> {
        Box::new(self.clone())
    }
}

/// How a computation's schema was established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    Declared(ResultSchema),
    Inferred(ResultSchema),
    /// Not yet probed
    Pending,
}

/// A computation with its name, arguments and schema
pub struct RegisteredComputation {
    name: String,
    computation: Box<dyn Computation>,
    args: Vec<Value>,
    schema: SchemaState,
}

impl std::fmt::Debug for RegisteredComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredComputation")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl RegisteredComputation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn schema_state(&self) -> &SchemaState {
        &self.schema
    }

    /// The established schema, if any
    pub fn schema(&self) -> Option<&ResultSchema> {
        match &self.schema {
            SchemaState::Declared(s) | SchemaState::Inferred(s) => Some(s),
            SchemaState::Pending => None,
        }
    }

    fn established(&self) -> Result<&ResultSchema, RegistryError> {
        self.schema()
            .ok_or_else(|| RegistryError::SchemaPending(self.name.clone()))
    }

    /// Fresh instance for a worker
    pub fn fork(&self) -> Box<dyn Computation> {
        self.computation.fork()
    }

    /// Run the computation once on `frame` to infer a pending schema
    pub fn resolve(&mut self, frame: &Frame) -> Result<&ResultSchema, ProbeError> {
        if let SchemaState::Pending = self.schema {
            let inferred = probe_named(&self.name, self.computation.as_ref(), &self.args, frame)?;
            self.schema = SchemaState::Inferred(inferred);
        }
        Ok(self.schema().unwrap_or(&ResultSchema::Opaque))
    }

    /// Allocate result storage for `rows` emitted frames
    pub fn allocate(&self, rows: usize, dir: &Path) -> Result<ResultBuffer, TrajparError> {
        let schema = self.established()?;
        Ok(ResultBuffer::allocate(schema, rows, dir)?)
    }

    /// Bytes of numeric storage needed for `rows` frames
    pub fn numeric_bytes(&self, rows: usize) -> usize {
        self.schema().map_or(0, |s| s.row_bytes() * rows)
    }
}

/// Invoke a fork of `computation` once and infer its schema
pub fn probe(
    computation: &dyn Computation,
    args: &[Value],
    frame: &Frame,
) -> Result<ResultSchema, ProbeError> {
    probe_named(DEFAULT_NAME, computation, args, frame)
}

fn probe_named(
    name: &str,
    computation: &dyn Computation,
    args: &[Value],
    frame: &Frame,
) -> Result<ResultSchema, ProbeError> {
    let mut fork = computation.fork();
    let value = fork
        .compute(frame, args)
        .map_err(|e| ProbeError::CallFailed {
            name: name.to_string(),
            frame: frame.index,
            message: e.to_string(),
        })?;
    let schema = schema::infer(&value);
    debug!(name, schema = %schema, "Probed result schema");
    Ok(schema)
}

/// Ordered collection of registered computations
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegisteredComputation>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computation, probing `reference` to infer its schema
    ///
    /// Returns the unique name it was registered under.
    pub fn register<C: Computation>(
        &mut self,
        name: Option<&str>,
        computation: C,
        args: Vec<Value>,
        reference: &Frame,
    ) -> Result<String, ProbeError> {
        let name = self.unique_name(name);
        let schema = probe_named(&name, &computation, &args, reference)?;
        Ok(self.push(name, Box::new(computation), args, SchemaState::Inferred(schema)))
    }

    /// Register a computation with an explicit schema
    pub fn register_with_schema<C: Computation>(
        &mut self,
        name: Option<&str>,
        computation: C,
        args: Vec<Value>,
        schema: ResultSchema,
    ) -> String {
        let name = self.unique_name(name);
        self.push(name, Box::new(computation), args, SchemaState::Declared(schema))
    }

    /// Register a computation whose schema is inferred at the start of the run
    pub fn register_deferred<C: Computation>(
        &mut self,
        name: Option<&str>,
        computation: C,
        args: Vec<Value>,
    ) -> String {
        let name = self.unique_name(name);
        self.push(name, Box::new(computation), args, SchemaState::Pending)
    }

    fn push(
        &mut self,
        name: String,
        computation: Box<dyn Computation>,
        args: Vec<Value>,
        schema: SchemaState,
    ) -> String {
        debug!(name = %name, schema = ?schema, "Registered computation");
        self.entries.push(RegisteredComputation {
            name: name.clone(),
            computation,
            args,
            schema,
        });
        name
    }

    /// `base`, or `base_2`, `base_3`, ... if already taken
    fn unique_name(&self, name: Option<&str>) -> String {
        let base = name.unwrap_or(DEFAULT_NAME);
        if !self.contains(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.contains(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredComputation, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredComputation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Probe every pending computation on `frame`
    pub fn resolve_pending(&mut self, frame: &Frame) -> Result<(), ProbeError> {
        for entry in &mut self.entries {
            entry.resolve(frame)?;
        }
        Ok(())
    }

    /// Whether any schema still needs probing
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.schema().is_none())
    }

    /// Schemas in registration order
    ///
    /// Fails if any schema is still pending.
    pub fn schemas(&self) -> Result<Vec<ResultSchema>, RegistryError> {
        self.entries
            .iter()
            .map(|e| e.established().cloned())
            .collect()
    }

    /// Take schemas established on another rank
    ///
    /// Every entry ends up with the schema given for it, whatever it had
    /// before, so rows written here lay out the same as on that rank.
    pub fn adopt(&mut self, schemas: &[ResultSchema]) -> Result<(), RegistryError> {
        if schemas.len() != self.entries.len() {
            return Err(RegistryError::SchemaCount {
                expected: self.entries.len(),
                got: schemas.len(),
            });
        }
        for (entry, schema) in self.entries.iter_mut().zip(schemas) {
            if entry.schema() == Some(schema) {
                continue;
            }
            if let Some(local) = entry.schema() {
                debug!(name = %entry.name, local = %local, adopted = %schema, "Replacing local schema");
            }
            entry.schema = SchemaState::Inferred(schema.clone());
        }
        Ok(())
    }
}
