//! Build steps and their fingerprints.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::store::WorkingCopy;

/// Cache key of a step: `<KIND>-<sha256 hex of its parameters as JSON>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of<T: Serialize + ?Sized>(kind: &str, params: &T) -> Result<Self> {
        let json = serde_json::to_vec(params)
            .with_context(|| format!("Failed to serialize {} step parameters", kind))?;
        Ok(Self(format!("{}-{:x}", kind, Sha256::digest(&json))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work applied to a working copy and committed on success.
pub trait AtomicStep: Send + Sync {
    /// Short human description for logs.
    fn describe(&self) -> String;

    /// Steps returning `None` are never cached.
    fn fingerprint(&self) -> Result<Option<Fingerprint>>;

    fn run(&self, copy: &WorkingCopy) -> Result<()>;
}

/// Either one atomic step or an ordered sequence of steps.
#[derive(Clone)]
pub enum Step {
    Atomic(Arc<dyn AtomicStep>),
    Sequence(Vec<Step>),
}

impl Step {
    pub fn atomic(step: impl AtomicStep + 'static) -> Self {
        Step::Atomic(Arc::new(step))
    }

    pub fn sequence(steps: impl IntoIterator<Item = Step>) -> Self {
        Step::Sequence(steps.into_iter().collect())
    }

    /// The atomic steps in execution order.
    pub fn atoms(&self) -> Vec<Arc<dyn AtomicStep>> {
        match self {
            Step::Atomic(step) => vec![Arc::clone(step)],
            Step::Sequence(steps) => steps.iter().flat_map(Step::atoms).collect(),
        }
    }
}

impl From<Vec<Step>> for Step {
    fn from(steps: Vec<Step>) -> Self {
        Step::Sequence(steps)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Atomic(step) => write!(f, "Atomic({})", step.describe()),
            Step::Sequence(steps) => f.debug_list().entries(steps).finish(),
        }
    }
}

type StepFn = dyn Fn(&WorkingCopy) -> Result<()> + Send + Sync;

/// A step backed by a closure, with an optional fingerprint.
pub struct FnStep {
    description: String,
    fingerprint: Option<Fingerprint>,
    func: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(description: impl Into<String>, func: F) -> Self
    where
        F: Fn(&WorkingCopy) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            fingerprint: None,
            func: Box::new(func),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

impl AtomicStep for FnStep {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(self.fingerprint.clone())
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        (self.func)(copy)
    }
}
