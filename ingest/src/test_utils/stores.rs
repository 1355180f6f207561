//! [`WarehouseStore`] wrappers with scripted failures and call observability.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::reports::{AboveMeanReport, QuarterlyHiresReport};
use crate::store::{ConflictPolicy, LoadOutcome, ViewKind, WarehouseStore};
use crate::test_utils::notify::TimedNotify;
use crate::types::{TableKind, ValidRow};

/// Methods of [`WarehouseStore`] that the wrappers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMethod {
    EnsureSchema,
    LoadRows,
    RefreshView,
    QuarterlyHires,
    DepartmentsAboveMean,
}

#[derive(Debug, Default)]
struct ScriptState {
    load_failures: VecDeque<ErrorKind>,
    refresh_failures: VecDeque<ErrorKind>,
    calls: HashMap<StoreMethod, u64>,
    method_call_notifiers: HashMap<StoreMethod, Vec<Arc<Notify>>>,
}

/// A store that injects scripted failures in front of a delegate.
///
/// Failures are consumed in order, one per call to the scripted method, and the
/// wrapper delegates once the script is exhausted. Every method call is counted and
/// can be observed through [`ScriptedStore::notify_on`], so tests can assert retry
/// behavior without guessing at timing.
#[derive(Debug, Clone)]
pub struct ScriptedStore<S> {
    inner: S,
    state: Arc<Mutex<ScriptState>>,
}

impl<S> ScriptedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Makes the next `count` calls to `load_rows` fail with the given kind.
    pub fn fail_next_loads(&self, kind: ErrorKind, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.load_failures.extend(std::iter::repeat_n(kind, count));
    }

    /// Makes the next `count` calls to `refresh_view` fail with the given kind.
    pub fn fail_next_refreshes(&self, kind: ErrorKind, count: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .refresh_failures
            .extend(std::iter::repeat_n(kind, count));
    }

    /// Number of calls made to `method` so far, scripted failures included.
    pub fn calls(&self, method: StoreMethod) -> u64 {
        let state = self.state.lock().unwrap();
        state.calls.get(&method).copied().unwrap_or(0)
    }

    /// Returns a notify that fires after every completed call to `method`.
    pub fn notify_on(&self, method: StoreMethod) -> TimedNotify {
        let notify = Arc::new(Notify::new());

        let mut state = self.state.lock().unwrap();
        state
            .method_call_notifiers
            .entry(method)
            .or_default()
            .push(notify.clone());

        TimedNotify::new(notify)
    }

    fn record_call(&self, method: StoreMethod) {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method).or_insert(0) += 1;
    }

    fn dispatch_method_notification(&self, method: StoreMethod) {
        let state = self.state.lock().unwrap();
        if let Some(notifiers) = state.method_call_notifiers.get(&method) {
            for notifier in notifiers {
                notifier.notify_one();
            }
        }
    }
}

impl<S> WarehouseStore for ScriptedStore<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    async fn ensure_schema(&self) -> IngestResult<()> {
        self.record_call(StoreMethod::EnsureSchema);

        let result = self.inner.ensure_schema().await;

        self.dispatch_method_notification(StoreMethod::EnsureSchema);

        result
    }

    async fn load_rows(
        &self,
        table: TableKind,
        rows: Vec<ValidRow>,
        policy: ConflictPolicy,
    ) -> IngestResult<LoadOutcome> {
        self.record_call(StoreMethod::LoadRows);

        let injected = self.state.lock().unwrap().load_failures.pop_front();
        let result = match injected {
            Some(kind) => Err(ingest_error!(kind, "Injected load failure")),
            None => self.inner.load_rows(table, rows, policy).await,
        };

        self.dispatch_method_notification(StoreMethod::LoadRows);

        result
    }

    async fn refresh_view(&self, view: ViewKind) -> IngestResult<()> {
        self.record_call(StoreMethod::RefreshView);

        let injected = self.state.lock().unwrap().refresh_failures.pop_front();
        let result = match injected {
            Some(kind) => Err(ingest_error!(kind, "Injected refresh failure")),
            None => self.inner.refresh_view(view).await,
        };

        self.dispatch_method_notification(StoreMethod::RefreshView);

        result
    }

    async fn quarterly_hires(&self, year: i32) -> IngestResult<QuarterlyHiresReport> {
        self.record_call(StoreMethod::QuarterlyHires);

        let result = self.inner.quarterly_hires(year).await;

        self.dispatch_method_notification(StoreMethod::QuarterlyHires);

        result
    }

    async fn departments_above_mean(&self, year: i32) -> IngestResult<AboveMeanReport> {
        self.record_call(StoreMethod::DepartmentsAboveMean);

        let result = self.inner.departments_above_mean(year).await;

        self.dispatch_method_notification(StoreMethod::DepartmentsAboveMean);

        result
    }
}

/// A store that holds every load open until the test releases it.
///
/// Each call to `load_rows` signals its arrival and then waits for one permit, so
/// tests can park a task mid-load, observe intermediate state, and decide when the
/// load completes.
#[derive(Debug, Clone)]
pub struct GatedStore<S> {
    inner: S,
    entered: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl<S> GatedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Returns a notify that fires each time a load reaches the gate.
    pub fn entered(&self) -> TimedNotify {
        TimedNotify::new(self.entered.clone())
    }

    /// Lets the next `loads` gated loads proceed.
    pub fn release(&self, loads: usize) {
        self.permits.add_permits(loads);
    }
}

impl<S> WarehouseStore for GatedStore<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    async fn ensure_schema(&self) -> IngestResult<()> {
        self.inner.ensure_schema().await
    }

    async fn load_rows(
        &self,
        table: TableKind,
        rows: Vec<ValidRow>,
        policy: ConflictPolicy,
    ) -> IngestResult<LoadOutcome> {
        self.entered.notify_one();
        self.permits.acquire().await.unwrap().forget();

        self.inner.load_rows(table, rows, policy).await
    }

    async fn refresh_view(&self, view: ViewKind) -> IngestResult<()> {
        self.inner.refresh_view(view).await
    }

    async fn quarterly_hires(&self, year: i32) -> IngestResult<QuarterlyHiresReport> {
        self.inner.quarterly_hires(year).await
    }

    async fn departments_above_mean(&self, year: i32) -> IngestResult<AboveMeanReport> {
        self.inner.departments_above_mean(year).await
    }
}
