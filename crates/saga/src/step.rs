//! Saga steps and the context they share.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use forgeq_core::SagaId;

/// Data shared by the steps of one saga instance.
///
/// Actions stash what their compensations will need (created ids, reserved
/// amounts). Cloning shares the same underlying map.
#[derive(Debug, Clone)]
pub struct SagaContext {
    saga_id: SagaId,
    data: Arc<Mutex<Map<String, JsonValue>>>,
}

impl SagaContext {
    pub fn new(saga_id: SagaId) -> Self {
        Self {
            saga_id,
            data: Arc::new(Mutex::new(Map::new())),
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    fn data(&self) -> MutexGuard<'_, Map<String, JsonValue>> {
        // A panicking step cannot leave the map half-written: every access is a single insert/read.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.data().insert(key.into(), value);
        Ok(())
    }

    /// Read a value previously stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data().contains_key(key)
    }

    /// Snapshot of all stored values as a JSON object.
    pub fn snapshot(&self) -> JsonValue {
        JsonValue::Object(self.data().clone())
    }
}

/// One step of a saga: a forward action and its compensation.
#[async_trait::async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    /// Once an irreversible step has started, the saga can no longer be cancelled.
    fn is_irreversible(&self) -> bool {
        false
    }

    /// Steps that do not apply are marked SKIPPED and never compensated.
    async fn applies(&self, _ctx: &SagaContext) -> bool {
        true
    }

    async fn execute(&self, ctx: &SagaContext) -> anyhow::Result<()>;

    /// Undo the effects of a completed `execute`.
    async fn compensate(&self, _ctx: &SagaContext) -> anyhow::Result<()> {
        Ok(())
    }
}

type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type StepFn = Box<dyn Fn(SagaContext) -> StepFuture + Send + Sync>;
type ConditionFn = Box<dyn Fn(&SagaContext) -> bool + Send + Sync>;

/// A [`SagaStep`] assembled from closures.
///
/// ```ignore
/// let step = FnStep::new("reserve_stock", |ctx| async move {
///     ctx.set("reservation", reserve().await?)?;
///     Ok(())
/// })
/// .with_compensation(|ctx| async move {
///     release(ctx.get::<String>("reservation")).await
/// });
/// ```
pub struct FnStep {
    name: String,
    irreversible: bool,
    action: StepFn,
    compensation: Option<StepFn>,
    condition: Option<ConditionFn>,
}

impl FnStep {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            irreversible: false,
            action: Box::new(move |ctx| Box::pin(action(ctx))),
            compensation: None,
            condition: None,
        }
    }

    pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.compensation = Some(Box::new(move |ctx| Box::pin(compensation(ctx))));
        self
    }

    /// Only run the action when `condition` holds; otherwise the step is SKIPPED.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&SagaContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Box::new(condition));
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }
}

impl core::fmt::Debug for FnStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("irreversible", &self.irreversible)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl SagaStep for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_irreversible(&self) -> bool {
        self.irreversible
    }

    async fn applies(&self, ctx: &SagaContext) -> bool {
        self.condition.as_ref().is_none_or(|condition| condition(ctx))
    }

    async fn execute(&self, ctx: &SagaContext) -> anyhow::Result<()> {
        (self.action)(ctx.clone()).await
    }

    async fn compensate(&self, ctx: &SagaContext) -> anyhow::Result<()> {
        match &self.compensation {
            Some(compensation) => compensation(ctx.clone()).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_values_round_trip() {
        let ctx = SagaContext::new(SagaId::new());
        ctx.set("invoice_id", "inv-42").unwrap();
        ctx.set("amount", 1250).unwrap();

        assert_eq!(ctx.get::<String>("invoice_id").as_deref(), Some("inv-42"));
        assert_eq!(ctx.get::<i64>("amount"), Some(1250));
        assert_eq!(ctx.get::<i64>("missing"), None);
        assert_eq!(ctx.snapshot()["amount"], 1250);
    }

    #[test]
    fn clones_share_data() {
        let ctx = SagaContext::new(SagaId::new());
        let other = ctx.clone();
        other.set("k", true).unwrap();
        assert!(ctx.contains("k"));
    }

    #[tokio::test]
    async fn conditional_step_reports_applicability() {
        let ctx = SagaContext::new(SagaId::new());
        let step = FnStep::new("notify", |_ctx| async { Ok(()) })
            .when(|ctx| ctx.get::<bool>("notify").unwrap_or(false));

        assert!(!step.applies(&ctx).await);
        ctx.set("notify", true).unwrap();
        assert!(step.applies(&ctx).await);
    }
}
