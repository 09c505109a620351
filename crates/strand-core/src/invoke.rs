//! Dynamic invocation path
//!
//! Lets a task call a pausable operation chosen at runtime. Operations are
//! registered once in an [`OperationRegistry`]; a call packages the resolved
//! operation, its target and its arguments into a [`DynamicCall`]. If the
//! call suspends, that record is the captured frame for the invoking level
//! (resume point [`DYNAMIC_CALL_PC`]), so a replay reuses it instead of
//! resolving the operation again.
//!
//! [`invoke`] is itself a pausable level: bracket it with `down()`/`up()`
//! exactly like a statically known callee.

use crate::error::InvokeError;
use crate::fiber::{Step, Up};
use crate::frame::Pc;
use crate::task::Cx;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Resume point recorded by a suspended dynamic call
pub const DYNAMIC_CALL_PC: Pc = 1;

/// Receiver of a dynamic call
pub type Target = Arc<dyn Any + Send + Sync>;

type OperationFn = dyn Fn(&mut Cx<'_>, &DynamicCall) -> anyhow::Result<Step<Value>> + Send + Sync;

/// A pausable operation in its resumable form.
#[derive(Clone)]
pub struct Operation {
    name: Arc<str>,
    func: Arc<OperationFn>,
}

impl Operation {
    /// Wrap `func` as an operation called `name`.
    ///
    /// `func` runs one level below the invoking level and must follow the
    /// down/up protocol for every pausable call it makes.
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut Cx<'_>, &DynamicCall) -> anyhow::Result<Step<Value>> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    /// Registered name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both handles refer to the same registered operation
    pub fn same_as(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Operation").field(&self.name).finish()
    }
}

/// Identity of one dynamic call: operation, target and arguments.
#[derive(Clone)]
pub struct DynamicCall {
    op: Operation,
    target: Option<Target>,
    args: Vec<Value>,
}

impl DynamicCall {
    /// Package a call
    pub fn new(op: Operation, target: Option<Target>, args: Vec<Value>) -> Self {
        Self { op, target, args }
    }

    /// The resolved operation
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// The call arguments
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The receiver, if any
    pub fn target_any(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// The receiver as a `T`
    pub fn target<T: Any + Send + Sync>(&self) -> Result<&T, InvokeError> {
        self.target
            .as_ref()
            .and_then(|target| {
                let target: &(dyn Any + Send + Sync) = &**target;
                target.downcast_ref::<T>()
            })
            .ok_or_else(|| InvokeError::TargetMismatch {
                op: self.op.name().to_string(),
                expected: type_name::<T>(),
            })
    }
}

impl fmt::Debug for DynamicCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCall")
            .field("op", &self.op.name())
            .field("has_target", &self.target.is_some())
            .field("args", &self.args)
            .finish()
    }
}

/// Registration table mapping an operation name to its resumable form.
///
/// Built once at initialization; lookups never search or rewrite anything.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    by_name: FxHashMap<Arc<str>, Operation>,
}

impl OperationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` as `name`. Fails if the name is taken.
    pub fn register<F>(&mut self, name: &str, func: F) -> Result<Operation, InvokeError>
    where
        F: Fn(&mut Cx<'_>, &DynamicCall) -> anyhow::Result<Step<Value>> + Send + Sync + 'static,
    {
        if self.by_name.contains_key(name) {
            return Err(InvokeError::DuplicateOperation(name.to_string()));
        }
        let op = Operation::new(name, func);
        self.by_name.insert(op.name.clone(), op.clone());
        Ok(op)
    }

    /// Look up an operation
    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.by_name.get(name)
    }

    /// Look up an operation, failing if it is unknown
    pub fn resolve(&self, name: &str) -> Result<Operation, InvokeError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| InvokeError::UnknownOperation(name.to_string()))
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Invoke the operation registered as `name`.
    ///
    /// The name is resolved only on a fresh call; a replay reuses the
    /// captured call record.
    pub fn invoke(
        &self,
        cx: &mut Cx<'_>,
        name: &str,
        target: Option<Target>,
        args: Vec<Value>,
    ) -> anyhow::Result<Step<Value>> {
        let call = match cx.restore::<DynamicCall>()? {
            Some((_, call)) => call,
            None => DynamicCall::new(self.resolve(name)?, target, args),
        };
        drive(cx, call)
    }
}

/// Invoke `op` on `target` with `args`, obeying the down/up protocol.
///
/// Returns [`Step::Unwind`] if the operation suspended; the caller treats it
/// like any other pausable callee.
pub fn invoke(
    cx: &mut Cx<'_>,
    op: &Operation,
    target: Option<Target>,
    args: Vec<Value>,
) -> anyhow::Result<Step<Value>> {
    let call = match cx.restore::<DynamicCall>()? {
        Some((_, call)) => call,
        None => DynamicCall::new(op.clone(), target, args),
    };
    drive(cx, call)
}

fn drive(cx: &mut Cx<'_>, call: DynamicCall) -> anyhow::Result<Step<Value>> {
    trace!(task = %cx.task_id(), op = call.op.name(), replay = cx.pc() != 0, "dynamic call");
    cx.down();
    let step = (call.op.func)(cx, &call)?;
    match cx.up()? {
        Up::Normal | Up::Retired => Ok(step),
        Up::Capture => {
            cx.capture(DYNAMIC_CALL_PC, call)?;
            Ok(Step::Unwind)
        }
        Up::Propagate => Ok(Step::Unwind),
    }
}
