//! Lifecycle owner for the broker runtime.
//!
//! The container is assembled by the application's composition root through
//! [`ContainerBuilder`] and owns every running subcomponent: one promotion
//! loop per delayed queue, one reaper and one poller per queue, and the
//! bounded worker pool they all feed. Subcomponents hold non-owning
//! references to the template and hooks; nothing points back at the
//! container.

mod config;
mod outcome;
mod poller;
mod reaper;
mod scheduler;
mod worker;

pub use self::config::ContainerConfig;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::codec::{ConverterChain, MessageConverter};
use crate::error::{ConfigError, ContainerError};
use crate::processor::{MessageProcessor, NoOpMessageProcessor};
use crate::registry::HandlerRegistry;
use crate::sender::MessageSender;
use crate::template::{MessageTemplate, RedisMessageTemplate};
use self::worker::WorkerContext;

/// Sleep for `duration` unless the stop signal fires first. Returns whether
/// the caller should stop.
pub(crate) async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = stop.changed() => changed.map(|()| *stop.borrow()).unwrap_or(true),
        _ = tokio::time::sleep(duration) => *stop.borrow(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Initial,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Initial => "initial",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        }
    }
}

enum TemplateSource {
    Provided(Arc<dyn MessageTemplate>),
    RedisUrl(String),
}

/// Builder for [`ListenerContainer`]. Validation happens once, at
/// [`build()`](Self::build) — a container can never reach `Running` with an
/// invalid configuration.
pub struct ContainerBuilder {
    config: ContainerConfig,
    registry: HandlerRegistry,
    template: Option<Arc<dyn MessageTemplate>>,
    redis_url: Option<String>,
    converters: Option<Vec<Arc<dyn MessageConverter>>>,
    discard_processor: Arc<dyn MessageProcessor>,
    dlq_processor: Arc<dyn MessageProcessor>,
    executor: Option<tokio::runtime::Handle>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            config: ContainerConfig::default(),
            registry: HandlerRegistry::new(),
            template: None,
            redis_url: None,
            converters: None,
            discard_processor: Arc::new(NoOpMessageProcessor),
            dlq_processor: Arc::new(NoOpMessageProcessor),
            executor: None,
        }
    }

    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Take a pre-populated registry. The registry freezes here; the
    /// container never mutates it.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use an existing template instead of connecting at start.
    pub fn template(mut self, template: Arc<dyn MessageTemplate>) -> Self {
        self.template = Some(template);
        self
    }

    /// Connect a [`RedisMessageTemplate`] at start. Ignored when a template
    /// is supplied directly.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Override the codec chain. The default chain is JSON only.
    pub fn message_converters(mut self, converters: Vec<Arc<dyn MessageConverter>>) -> Self {
        self.converters = Some(converters);
        self
    }

    /// Hook fired when a message is discarded after exhausting retries with
    /// no DLQ configured.
    pub fn discard_message_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.discard_processor = processor;
        self
    }

    /// Hook fired when a message is moved to a dead-letter queue.
    pub fn dead_letter_queue_message_processor(
        mut self,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        self.dlq_processor = processor;
        self
    }

    /// Spawn loops and workers onto a specific runtime instead of the one
    /// `start()` is called from.
    pub fn task_executor(mut self, handle: tokio::runtime::Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    pub fn build(self) -> Result<ListenerContainer, ConfigError> {
        if self.registry.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        let converters = match self.converters {
            Some(converters) => ConverterChain::new(converters)?,
            None => ConverterChain::json(),
        };
        let template_source = match (self.template, self.redis_url) {
            (Some(template), _) => TemplateSource::Provided(template),
            (None, Some(url)) => TemplateSource::RedisUrl(url),
            (None, None) => return Err(ConfigError::NoTemplate),
        };
        Ok(ListenerContainer {
            config: self.config,
            registry: Arc::new(self.registry),
            converters,
            template_source,
            discard_processor: self.discard_processor,
            dlq_processor: self.dlq_processor,
            executor: self.executor,
            state: Mutex::new(Lifecycle::Initial),
            running: Mutex::new(None),
        })
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningState {
    stop_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    pool: Arc<Semaphore>,
    pool_slots: usize,
    template: Arc<dyn MessageTemplate>,
}

/// Owns and supervises the broker loops.
///
/// Lifecycle: `Initial → Starting → Running → Stopping → Stopped`, with
/// `Stopped → Starting` allowed for restarts. `start`/`stop` from any other
/// state is an [`ContainerError::InvalidState`].
pub struct ListenerContainer {
    config: ContainerConfig,
    registry: Arc<HandlerRegistry>,
    converters: ConverterChain,
    template_source: TemplateSource,
    discard_processor: Arc<dyn MessageProcessor>,
    dlq_processor: Arc<dyn MessageProcessor>,
    executor: Option<tokio::runtime::Handle>,
    state: Mutex<Lifecycle>,
    running: Mutex<Option<RunningState>>,
}

impl ListenerContainer {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// Start the broker: connect the template if none was supplied, persist
    /// each queue's config hash, then launch the loops.
    pub async fn start(&self) -> Result<(), ContainerError> {
        self.transition(&[Lifecycle::Initial, Lifecycle::Stopped], Lifecycle::Starting)?;
        match self.launch().await {
            Ok(running) => {
                *self.running_lock() = Some(running);
                self.set_state(Lifecycle::Running);
                info!(queues = self.registry.len(), "container running");
                Ok(())
            }
            Err(e) => {
                self.set_state(Lifecycle::Stopped);
                Err(e)
            }
        }
    }

    /// Honor the `auto_startup` flag: start unless it is disabled. Returns
    /// whether the container was started.
    pub async fn start_if_enabled(&self) -> Result<bool, ContainerError> {
        if !self.config.auto_startup {
            return Ok(false);
        }
        self.start().await?;
        Ok(true)
    }

    /// Signal every loop to quiesce, wait up to the shutdown grace period,
    /// then abandon whatever is left — the visibility timeout recovers any
    /// message that was mid-flight.
    pub async fn stop(&self) -> Result<(), ContainerError> {
        self.transition(&[Lifecycle::Running], Lifecycle::Stopping)?;
        let running = self.running_lock().take();
        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_grace_ms);

            for mut handle in running.loops {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                    warn!("loop did not stop within the grace period, aborting");
                    handle.abort();
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let all_slots = running.pool.clone();
            match tokio::time::timeout(
                remaining,
                all_slots.acquire_many_owned(running.pool_slots as u32),
            )
            .await
            {
                Ok(Ok(_permits)) => {}
                _ => warn!(
                    "abandoning in-flight handlers; the visibility timeout will recover their messages"
                ),
            }
        }
        self.set_state(Lifecycle::Stopped);
        info!("container stopped");
        Ok(())
    }

    /// A producer bound to the running template. `None` until the container
    /// has started.
    pub fn sender(&self) -> Option<MessageSender> {
        self.running_lock().as_ref().map(|running| {
            MessageSender::new(
                running.template.clone(),
                self.registry.clone(),
                self.converters.clone(),
            )
        })
    }

    pub fn is_running(&self) -> bool {
        *self.state_lock() == Lifecycle::Running
    }

    /// Current lifecycle state, for logs and diagnostics.
    pub fn lifecycle(&self) -> &'static str {
        self.state_lock().name()
    }

    async fn launch(&self) -> Result<RunningState, ContainerError> {
        let template: Arc<dyn MessageTemplate> = match &self.template_source {
            TemplateSource::Provided(template) => template.clone(),
            TemplateSource::RedisUrl(url) => Arc::new(RedisMessageTemplate::connect(url).await?),
        };

        for descriptor in self.registry.descriptors() {
            template.write_queue_config(descriptor).await?;
        }

        let pool_slots = self
            .config
            .max_num_workers
            .unwrap_or(self.registry.len())
            .max(1);
        let pool = Arc::new(Semaphore::new(pool_slots));
        let (stop_tx, _) = watch::channel(false);
        let executor = self
            .executor
            .clone()
            .unwrap_or_else(tokio::runtime::Handle::current);
        let mut loops = Vec::new();

        for registration in self.registry.registrations() {
            let descriptor = &registration.descriptor;
            if descriptor.delayed {
                loops.push(executor.spawn(scheduler::run(
                    template.clone(),
                    descriptor.name.clone(),
                    self.config.clone(),
                    stop_tx.subscribe(),
                )));
            }
            loops.push(executor.spawn(reaper::run(
                template.clone(),
                descriptor.clone(),
                self.config.clone(),
                stop_tx.subscribe(),
            )));

            let ctx = Arc::new(WorkerContext {
                template: template.clone(),
                registration: registration.clone(),
                converters: self.converters.clone(),
                discard_processor: self.discard_processor.clone(),
                dlq_processor: self.dlq_processor.clone(),
                back_off_time_ms: self.config.back_off_time_ms,
                executor: executor.clone(),
            });
            loops.push(executor.spawn(poller::run(
                ctx,
                pool.clone(),
                self.config.clone(),
                stop_tx.subscribe(),
            )));
        }

        info!(
            queues = self.registry.len(),
            workers = pool_slots,
            "broker loops launched"
        );
        Ok(RunningState {
            stop_tx,
            loops,
            pool,
            pool_slots,
            template,
        })
    }

    fn transition(&self, from: &[Lifecycle], to: Lifecycle) -> Result<(), ContainerError> {
        let mut state = self.state_lock();
        if !from.contains(&state) {
            return Err(ContainerError::InvalidState(state.name()));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: Lifecycle) {
        *self.state_lock() = to;
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().expect("lifecycle lock poisoned")
    }

    fn running_lock(&self) -> std::sync::MutexGuard<'_, Option<RunningState>> {
        self.running.lock().expect("running-state lock poisoned")
    }
}
