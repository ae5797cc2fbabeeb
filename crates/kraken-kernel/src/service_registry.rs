//! [`ServiceRegistry`] – the fixed-capacity table of named services.
//!
//! Each service moves through
//!
//! ```text
//! register ──► Registered ──start──► Starting ──init ok──► Running
//!                  ▲  ▲                 │                     │
//!                  │  └───init failed───┘                   stop
//!                  │                                          ▼
//!                  └────────────── deinit done ◄──────── Stopping
//! ```
//!
//! and leaves the table only through [`unregister`](ServiceRegistry::unregister),
//! which stops a running service first.
//!
//! The registry lock is never held while a hook runs. Hooks may therefore
//! query permissions, subscribe and post; a concurrent lifecycle call on a
//! service in `Starting` or `Stopping` is rejected instead of waiting.
//! A hook that panics, or whose caller stops awaiting it, leaves the
//! service `Registered`.
//!
//! Services are addressed by name only. Removal compacts the table, so no
//! slot index is ever handed out.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use kraken_types::{KernelError, Permissions};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::capability_verifier;
use crate::config::KernelConfig;
use crate::context::{self, CapabilityToken, ServiceContext};

/// Future returned by a lifecycle hook.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), KernelError>> + Send>>;

/// A service's `init` or `deinit` callback.
pub type ServiceHook = Arc<dyn Fn(ServiceContext) -> HookFuture + Send + Sync>;

/// Wrap an async closure as a [`ServiceHook`].
///
/// ```
/// use kraken_kernel::service_registry::hook;
///
/// let init = hook(|ctx| async move {
///     tracing::info!(service = ctx.name(), "bringing radio up");
///     Ok(())
/// });
/// # let _ = init;
/// ```
pub fn hook<F, Fut>(f: F) -> ServiceHook
where
    F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), KernelError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Registered,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Registered,
        }
    }
}

/// Lifecycle cell shared between the table and an in-flight hook, so the
/// outcome of a hook is committed without re-taking the registry lock.
#[derive(Debug, Default)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// An in-flight `Starting`/`Stopping` transition. Unless it is finished
/// explicitly, dropping it (a cancelled caller, a panicking hook) puts the
/// service back to `Registered`.
struct Transition {
    lifecycle: Arc<Lifecycle>,
    done: bool,
}

impl Transition {
    fn begin(lifecycle: Arc<Lifecycle>, state: ServiceState) -> Self {
        lifecycle.set(state);
        Self {
            lifecycle,
            done: false,
        }
    }

    fn finish(mut self, state: ServiceState) {
        self.lifecycle.set(state);
        self.done = true;
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        if !self.done {
            self.lifecycle.set(ServiceState::Registered);
        }
    }
}

/// Public snapshot of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub permissions: Permissions,
    pub state: ServiceState,
}

pub(crate) struct ServiceRecord {
    name: String,
    permissions: Permissions,
    init: Option<ServiceHook>,
    deinit: Option<ServiceHook>,
    lifecycle: Arc<Lifecycle>,
    checksum: u32,
    instance: Uuid,
}

impl ServiceRecord {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.name.clone(),
            permissions: self.permissions,
            state: self.lifecycle.get(),
        }
    }
}

pub(crate) type ServiceTable = Mutex<Vec<ServiceRecord>>;

/// Fixed-capacity registry of named, permissioned services.
pub struct ServiceRegistry {
    table: Arc<ServiceTable>,
    max_services: usize,
    name_max_len: usize,
    lock_timeout: Duration,
    query_timeout: Duration,
}

impl ServiceRegistry {
    /// Create an empty registry sized from `config`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] when a capacity is zero.
    pub fn new(config: &KernelConfig) -> Result<Self, KernelError> {
        config.validate_registry()?;
        Ok(Self {
            table: Arc::new(Mutex::new(Vec::with_capacity(config.max_services))),
            max_services: config.max_services,
            name_max_len: config.name_max_len,
            lock_timeout: config.registry_lock_timeout(),
            query_timeout: config.permission_lock_timeout(),
        })
    }

    /// Add a service in the `Registered` state. Its permissions are frozen
    /// from here on.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidArgument`] – empty or over-long name.
    /// - [`KernelError::AlreadyExists`] – the name is taken.
    /// - [`KernelError::ResourceExhausted`] – the table is full.
    /// - [`KernelError::Timeout`] – the registry lock was not acquired.
    #[instrument(skip(self, init, deinit))]
    pub async fn register(
        &self,
        name: &str,
        permissions: Permissions,
        init: Option<ServiceHook>,
        deinit: Option<ServiceHook>,
    ) -> Result<(), KernelError> {
        self.validate_name(name)?;
        let mut table = self.lock().await?;

        if find(&table, name).is_some() {
            error!("service already exists");
            return Err(KernelError::AlreadyExists(name.to_string()));
        }
        if table.len() >= self.max_services {
            error!(capacity = self.max_services, "max services reached");
            return Err(KernelError::ResourceExhausted(format!(
                "service table full ({} entries)",
                self.max_services
            )));
        }

        table.push(ServiceRecord {
            name: name.to_string(),
            permissions,
            init,
            deinit,
            lifecycle: Arc::new(Lifecycle::default()),
            checksum: capability_verifier::compute_checksum(name, permissions),
            instance: Uuid::new_v4(),
        });
        info!("service registered");
        Ok(())
    }

    /// Remove a service, stopping it first if it is running. A failing
    /// `deinit` is logged and does not prevent removal.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] – no such service.
    /// - [`KernelError::InvalidState`] – the service is mid start/stop.
    /// - [`KernelError::Timeout`] – the registry lock was not acquired. If
    ///   this happens after `deinit` ran, the service is left registered and
    ///   stopped.
    #[instrument(skip(self))]
    pub async fn unregister(&self, name: &str) -> Result<(), KernelError> {
        let pending_stop = {
            let mut table = self.lock().await?;
            let index = find(&table, name).ok_or_else(|| not_found(name))?;
            let record = &table[index];
            match record.lifecycle.get() {
                ServiceState::Starting | ServiceState::Stopping => {
                    return Err(in_transition(name));
                }
                ServiceState::Running if record.deinit.is_some() => {
                    Some(self.pending(record, record.deinit.clone(), ServiceState::Stopping))
                }
                ServiceState::Running | ServiceState::Registered => {
                    table.remove(index);
                    info!("service unregistered");
                    return Ok(());
                }
            }
        };

        if let Some((deinit, ctx, transition, instance)) = pending_stop {
            run_deinit(name, deinit, ctx).await;
            transition.finish(ServiceState::Registered);

            let mut table = self.lock().await?;
            if let Some(index) = table.iter().position(|r| r.instance == instance) {
                table.remove(index);
            }
        }
        info!("service unregistered");
        Ok(())
    }

    /// Run the service's `init` hook with the current-service marker set,
    /// and mark it running on success. Starting a running service is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] – no such service.
    /// - [`KernelError::InvalidState`] – the service is mid start/stop.
    /// - [`KernelError::Timeout`] – the registry lock was not acquired.
    /// - Whatever `init` returned; the service stays `Registered`.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<(), KernelError> {
        let (init, ctx, transition, _) = {
            let table = self.lock().await?;
            let record = find(&table, name)
                .map(|i| &table[i])
                .ok_or_else(|| not_found(name))?;
            match record.lifecycle.get() {
                ServiceState::Running => return Ok(()),
                ServiceState::Starting | ServiceState::Stopping => {
                    return Err(in_transition(name));
                }
                ServiceState::Registered => {}
            }
            self.pending(record, record.init.clone(), ServiceState::Starting)
        };

        if let Some(init) = init {
            if let Err(err) = run_hook(name, init, ctx).await {
                drop(transition);
                error!(%err, "failed to initialize service");
                return Err(err);
            }
        }

        transition.finish(ServiceState::Running);
        info!("service started");
        Ok(())
    }

    /// Run the service's `deinit` hook with the current-service marker set
    /// and mark it stopped. Stop is best-effort: a failing `deinit` is
    /// logged and the service is still marked stopped. Stopping a service
    /// that is not running is a no-op.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] – no such service.
    /// - [`KernelError::InvalidState`] – the service is mid start/stop.
    /// - [`KernelError::Timeout`] – the registry lock was not acquired.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<(), KernelError> {
        let (deinit, ctx, transition, _) = {
            let table = self.lock().await?;
            let record = find(&table, name)
                .map(|i| &table[i])
                .ok_or_else(|| not_found(name))?;
            match record.lifecycle.get() {
                ServiceState::Registered => return Ok(()),
                ServiceState::Starting | ServiceState::Stopping => {
                    return Err(in_transition(name));
                }
                ServiceState::Running => {}
            }
            self.pending(record, record.deinit.clone(), ServiceState::Stopping)
        };

        run_deinit(name, deinit, ctx).await;
        transition.finish(ServiceState::Registered);
        info!("service stopped");
        Ok(())
    }

    /// `true` only when `name` is registered, passes tamper verification,
    /// and holds every bit of `permission`. Any doubt resolves to `false`,
    /// including a lock timeout and an empty request.
    pub async fn has_permission(&self, name: &str, permission: Permissions) -> bool {
        if permission.is_empty() {
            return false;
        }
        let Ok(table) = lock_table(&self.table, self.query_timeout).await else {
            warn!(service = name, "registry lock timed out during permission query");
            return false;
        };
        let Some(record) = find(&table, name).map(|i| &table[i]) else {
            return false;
        };
        match capability_verifier::verify(&record.name, record.permissions, record.checksum) {
            Ok(()) => record.permissions.contains(permission),
            Err(_) => {
                error!(service = name, "permission verification failed");
                false
            }
        }
    }

    /// Check `permission` for the service whose hook is running on the
    /// calling task.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidState`] – not called from inside an
    ///   `init`/`deinit` hook.
    /// - [`KernelError::InvalidArgument`] – `permission` is empty.
    /// - [`KernelError::NotFound`] – the marked service no longer exists.
    /// - [`KernelError::NotAllowed`] – bit missing or tampering detected.
    /// - [`KernelError::Timeout`] – the registry lock was not acquired.
    pub async fn check_caller_permission(
        &self,
        permission: Permissions,
    ) -> Result<(), KernelError> {
        let Some(caller) = context::current_service() else {
            warn!("no service context for permission check");
            return Err(KernelError::InvalidState(
                "permission check outside a service init/deinit".into(),
            ));
        };
        authorize(&self.table, self.lock_timeout, &caller, None, permission).await
    }

    pub async fn info(&self, name: &str) -> Result<ServiceInfo, KernelError> {
        let table = self.lock().await?;
        find(&table, name)
            .map(|i| table[i].info())
            .ok_or_else(|| not_found(name))
    }

    /// Every registered service, in registration order.
    pub async fn list(&self) -> Result<Vec<ServiceInfo>, KernelError> {
        Ok(self.lock().await?.iter().map(ServiceRecord::info).collect())
    }

    /// Overwrite a stored mask without updating its checksum.
    #[cfg(test)]
    pub(crate) async fn tamper_permissions(&self, name: &str, permissions: Permissions) {
        let mut table = self.table.lock().await;
        let index = find(&table, name).expect("service registered");
        table[index].permissions = permissions;
    }

    fn validate_name(&self, name: &str) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument("service name is empty".into()));
        }
        if name.len() > self.name_max_len {
            return Err(KernelError::InvalidArgument(format!(
                "service name '{name}' exceeds {} bytes",
                self.name_max_len
            )));
        }
        Ok(())
    }

    /// Enter `state` and collect everything a hook invocation needs once
    /// the lock is released.
    fn pending(
        &self,
        record: &ServiceRecord,
        hook: Option<ServiceHook>,
        state: ServiceState,
    ) -> (Option<ServiceHook>, ServiceContext, Transition, Uuid) {
        let token = CapabilityToken::new(
            record.name.clone(),
            record.instance,
            Arc::downgrade(&self.table),
            self.lock_timeout,
        );
        (
            hook,
            ServiceContext::new(token),
            Transition::begin(Arc::clone(&record.lifecycle), state),
            record.instance,
        )
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Vec<ServiceRecord>>, KernelError> {
        lock_table(&self.table, self.lock_timeout).await
    }
}

async fn lock_table(
    table: &ServiceTable,
    timeout: Duration,
) -> Result<MutexGuard<'_, Vec<ServiceRecord>>, KernelError> {
    tokio::time::timeout(timeout, table.lock())
        .await
        .map_err(|_| KernelError::Timeout("service registry lock".into()))
}

/// Resolve `name` (and, for tokens, the exact registration `instance`),
/// verify its checksum and test `required`.
pub(crate) async fn authorize(
    table: &ServiceTable,
    timeout: Duration,
    name: &str,
    instance: Option<Uuid>,
    required: Permissions,
) -> Result<(), KernelError> {
    if required.is_empty() {
        return Err(KernelError::InvalidArgument(
            "permission request is empty".into(),
        ));
    }
    let table = lock_table(table, timeout).await?;
    let record = table
        .iter()
        .find(|r| r.name == name && instance.is_none_or(|id| id == r.instance))
        .ok_or_else(|| {
            error!(service = name, "service not found for permission check");
            not_found(name)
        })?;

    let denied = || KernelError::NotAllowed {
        service: name.to_string(),
        required,
    };
    if capability_verifier::verify(&record.name, record.permissions, record.checksum).is_err() {
        error!(service = name, "SECURITY VIOLATION: permissions tampered");
        return Err(denied());
    }
    if !record.permissions.contains(required) {
        error!(service = name, ?required, "denied: missing permission");
        return Err(denied());
    }
    debug!(service = name, ?required, "permission granted");
    Ok(())
}

/// Await `hook` with the current-service marker set. A panic inside the
/// hook is reported as [`KernelError::Failed`].
async fn run_hook(name: &str, hook: ServiceHook, ctx: ServiceContext) -> Result<(), KernelError> {
    let invocation = context::scoped(name.to_string(), async move { hook(ctx).await });
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(service = name, "lifecycle hook panicked");
            Err(KernelError::Failed(format!("hook of service '{name}' panicked")))
        }
    }
}

async fn run_deinit(name: &str, deinit: Option<ServiceHook>, ctx: ServiceContext) {
    let Some(deinit) = deinit else {
        return;
    };
    if let Err(err) = run_hook(name, deinit, ctx).await {
        warn!(service = name, %err, "service deinit failed");
    }
}

fn find(table: &[ServiceRecord], name: &str) -> Option<usize> {
    table.iter().position(|r| r.name == name)
}

fn not_found(name: &str) -> KernelError {
    KernelError::NotFound(format!("service '{name}'"))
}

fn in_transition(name: &str) -> KernelError {
    KernelError::InvalidState(format!("service '{name}' is starting or stopping"))
}
