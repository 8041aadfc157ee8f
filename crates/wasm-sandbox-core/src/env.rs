//! Execution environments.

use std::fmt;
use std::mem;

use tracing::debug;
use uuid::Uuid;

use crate::arena::ArenaLease;
use crate::handle::SharedHandle;
use crate::instance::ModuleInstance;
use crate::invoke::CallInvoker;
use crate::marshal::{CallArgs, CallResults};
use crate::user_data::UserData;
use wasm_sandbox_common::{Resource, RuntimeError};

/// Call context bound to one module instance.
///
/// Owns a stack reservation and exactly one [`UserData`]. The instance is
/// held for as long as the environment lives.
pub struct ExecutionEnvironment {
    id: Uuid,
    stack_size: u32,
    user_data: UserData,
    _stack_lease: ArenaLease,
    instance: SharedHandle<ModuleInstance>,
}

impl ExecutionEnvironment {
    pub(crate) fn create(
        instance: &SharedHandle<ModuleInstance>,
        stack_size: u32,
    ) -> Result<Self, RuntimeError> {
        let runtime = instance.module().runtime();
        let max = runtime.config().max_wasm_stack;

        if stack_size == 0 || stack_size > max {
            return Err(RuntimeError::init_failed(
                Resource::ExecutionEnvironment,
                format!("stack size {stack_size} outside 1..={max}"),
            ));
        }

        let stack_lease = runtime
            .arena()
            .lease(u64::from(stack_size), Resource::ExecutionEnvironment)?;
        let id = Uuid::new_v4();

        debug!(
            environment_id = %id,
            instance_id = %instance.id(),
            stack_size,
            "Execution environment created"
        );

        Ok(Self {
            id,
            stack_size,
            user_data: UserData::default(),
            _stack_lease: stack_lease,
            instance: instance.clone(),
        })
    }

    /// Unique id of this environment.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reserved stack size in bytes.
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// The instance this environment calls into.
    pub fn instance(&self) -> &SharedHandle<ModuleInstance> {
        &self.instance
    }

    /// The environment's user data.
    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    /// Mutable access to the environment's user data.
    pub fn user_data_mut(&mut self) -> &mut UserData {
        &mut self.user_data
    }

    /// Replace the user data. The previous value is dropped.
    pub fn set_user_data(&mut self, user_data: UserData) {
        self.user_data = user_data;
    }

    /// Call an exported function. See [`CallInvoker::call`].
    ///
    /// # Errors
    ///
    /// Returns `Lookup`, `TypeMismatch`, `InstanceBusy` or `GuestTrap`.
    pub fn execute_function<R: CallResults, A: CallArgs>(
        &mut self,
        name: &str,
        args: A,
    ) -> Result<R, RuntimeError> {
        CallInvoker::new(self).call(name, args)
    }

    pub(crate) fn take_user_data(&mut self) -> UserData {
        mem::take(&mut self.user_data)
    }

    pub(crate) fn restore_user_data(&mut self, user_data: UserData) {
        self.user_data = user_data;
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        debug!(environment_id = %self.id, "Execution environment destroyed");
    }
}

impl fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("id", &self.id)
            .field("stack_size", &self.stack_size)
            .field("instance_id", &self.instance.id())
            .finish_non_exhaustive()
    }
}
