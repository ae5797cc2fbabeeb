//! "Who is calling" for permission checks.
//!
//! Two mechanisms coexist:
//!
//! - The ambient **current-service marker**, a Tokio task-local that the
//!   registry sets only while it awaits a service's `init` or `deinit` hook.
//!   [`Kernel::check_caller_permission`](crate::Kernel::check_caller_permission)
//!   reads it. Tasks the hook spawns do not inherit it.
//! - An explicit [`CapabilityToken`] handed to the hook inside its
//!   [`ServiceContext`]. It can be cloned into the service's long-running
//!   tasks and stays valid for exactly one registration of that service.

use std::fmt;
use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use kraken_types::{KernelError, Permissions};
use uuid::Uuid;

use crate::service_registry::{self, ServiceTable};

tokio::task_local! {
    static CURRENT_SERVICE: String;
}

/// Name of the service whose `init`/`deinit` hook is running on this task,
/// if any.
pub fn current_service() -> Option<String> {
    CURRENT_SERVICE.try_with(Clone::clone).ok()
}

/// Run `hook` with the current-service marker set to `name`. The marker is
/// gone once the future completes, whatever its outcome.
pub(crate) async fn scoped<F: Future>(name: String, hook: F) -> F::Output {
    CURRENT_SERVICE.scope(name, hook).await
}

/// Proof of identity for one registration of a service.
#[derive(Clone)]
pub struct CapabilityToken {
    service: String,
    instance: Uuid,
    table: Weak<ServiceTable>,
    lock_timeout: Duration,
}

impl CapabilityToken {
    pub(crate) fn new(
        service: String,
        instance: Uuid,
        table: Weak<ServiceTable>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            service,
            instance,
            table,
            lock_timeout,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Check that the bound service still exists, passes tamper
    /// verification, and holds every bit of `required`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidArgument`] – `required` is empty.
    /// - [`KernelError::InvalidState`] – the kernel has been torn down.
    /// - [`KernelError::NotFound`] – this registration was removed, even if
    ///   the name has since been registered again.
    /// - [`KernelError::NotAllowed`] – bit missing or tampering detected.
    /// - [`KernelError::Timeout`] – the registry lock was not acquired.
    pub async fn check(&self, required: Permissions) -> Result<(), KernelError> {
        let table = self
            .table
            .upgrade()
            .ok_or_else(|| KernelError::InvalidState("kernel is not initialized".into()))?;
        service_registry::authorize(
            &table,
            self.lock_timeout,
            &self.service,
            Some(self.instance),
            required,
        )
        .await
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("service", &self.service)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Argument passed to every `init`/`deinit` hook.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    token: CapabilityToken,
}

impl ServiceContext {
    pub(crate) fn new(token: CapabilityToken) -> Self {
        Self { token }
    }

    /// Name of the service being started or stopped.
    pub fn name(&self) -> &str {
        self.token.service()
    }

    pub fn token(&self) -> CapabilityToken {
        self.token.clone()
    }
}
