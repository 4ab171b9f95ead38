//! The bounded, back-pressured processing pipeline.
//!
//! One processor serves one product. Messages flow through three stage
//! pools connected by bounded channels:
//!
//! ```text
//! push() → [admission queue] → router (parse + route, one task)
//!            → [lane queues] → transform workers (filter/transform)
//!            → [lane queues] → emit workers (project → encode → emit)
//! ```
//!
//! The admission queue is the sole back-pressure point: `push` blocks only
//! when it is full. The router preserves admission order and routes each
//! message to a transform lane by the jump-consistent hash of its decoded
//! primary key; fan-out children are re-routed to emit lanes by their own
//! keys. Same key → same lane → FIFO, which is the per-PK ordering
//! guarantee. Across different keys, lanes run in parallel and no order is
//! promised.
//!
//! Failure policy (deterministic → DLQ + ACK, transient → retry, shutdown
//! → NACK) lives in the stage loops; see the crate's error module.

mod completion;
mod hash;

pub use completion::Completion;
pub use hash::{jump_consistent_hash, pk_hash};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use gravity_record::{ProductEvent, Record, RecordCodec, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ProcessorConfig, RetryConfig};
use crate::dlq::{DeadLetter, DeadLetterQueue, Stage};
use crate::error::{DispatchError, Result};
use crate::message::{Message, MessageRawData};
use crate::rule::Rule;
use crate::rule_manager::RuleManager;
use crate::transform::Transformer;

/// Primary-key component separator (ASCII unit separator).
const PK_SEPARATOR: char = '\u{1F}';

/// Receives each finished product event, synchronously: the handler's
/// return drives the ACK of the source message.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Handles one output. The message carries the projected record and
    /// the encoded [`ProductEvent`].
    ///
    /// # Errors
    ///
    /// Transient failures (`PublishFailure`, `Bus`) are retried with
    /// backoff; anything else dead-letters the message.
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Discards all output. Used when a processor is built without a handler.
struct NoopOutput;

#[async_trait]
impl OutputHandler for NoopOutput {
    async fn handle(&self, _message: &Message) -> Result<()> {
        Ok(())
    }
}

/// Builder for [`Processor`].
pub struct ProcessorBuilder {
    product: String,
    config: ProcessorConfig,
    rule_manager: Option<Arc<RuleManager>>,
    codec: Arc<dyn RecordCodec>,
    output: Arc<dyn OutputHandler>,
    dlq: Option<Arc<DeadLetterQueue>>,
}

impl ProcessorBuilder {
    /// Sets the output handler.
    #[must_use]
    pub fn with_output_handler(mut self, output: Arc<dyn OutputHandler>) -> Self {
        self.output = output;
        self
    }

    /// Sets the worker count for the transform and emit pools.
    #[must_use]
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.config = self.config.with_worker_count(n);
        self
    }

    /// Sets the admission queue depth.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.config = self.config.with_queue_depth(depth);
        self
    }

    /// Sets the full processor configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the rule manager used to resolve rules during parse.
    #[must_use]
    pub fn with_rule_manager(mut self, rule_manager: Arc<RuleManager>) -> Self {
        self.rule_manager = Some(rule_manager);
        self
    }

    /// Sets the record codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the dead-letter queue handle.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Spawns the pipeline tasks and returns the running processor.
    #[must_use]
    pub fn build(self) -> Processor {
        Processor::start(self)
    }
}

/// Shared, read-only state for all pipeline stages.
struct PipelineContext {
    product: String,
    rule_manager: Option<Arc<RuleManager>>,
    codec: Arc<dyn RecordCodec>,
    output: Arc<dyn OutputHandler>,
    dlq: Option<Arc<DeadLetterQueue>>,
    retry: RetryConfig,
    /// Fields already warned about, so coercion noise logs once per field.
    warned_fields: Mutex<FxHashSet<String>>,
}

impl PipelineContext {
    /// Dead-letters a failed message. The caller still ACKs: a
    /// deterministic failure is parked, not redelivered.
    fn report_failure(
        &self,
        raw: &Bytes,
        event: Option<&str>,
        stage: Stage,
        err: &DispatchError,
    ) {
        if matches!(err, DispatchError::Codec(_)) {
            error!(
                product = %self.product,
                stage = %stage,
                error = %err,
                "codec failure, dead-lettering message"
            );
        } else {
            warn!(
                product = %self.product,
                stage = %stage,
                error = %err,
                "dead-lettering message"
            );
        }
        if let Some(dlq) = &self.dlq {
            dlq.report(DeadLetter {
                product: self.product.clone(),
                event: event.map(str::to_string),
                raw: raw.clone(),
                stage,
                reason: err.kind(),
                error: err.to_string(),
            });
        }
    }

    fn warn_dropped_fields(&self, warnings: &[crate::schema::FieldWarning]) {
        if warnings.is_empty() {
            return;
        }
        let mut warned = self.warned_fields.lock();
        for warning in warnings {
            if warned.insert(warning.field.clone()) {
                warn!(
                    product = %self.product,
                    field = %warning.field,
                    "{warning}"
                );
            }
        }
    }
}

/// A transformed output record en route to the emit stage.
struct ChildMessage {
    raw: Bytes,
    msg_id: Option<String>,
    rule: Arc<Rule>,
    record: Record,
    partial: bool,
    completion: Arc<Completion>,
}

/// The running pipeline for one product.
pub struct Processor {
    admission: Mutex<Option<mpsc::Sender<Message>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Processor {
    /// Starts building a processor for a product.
    #[must_use]
    pub fn builder(product: impl Into<String>) -> ProcessorBuilder {
        ProcessorBuilder {
            product: product.into(),
            config: ProcessorConfig::default(),
            rule_manager: None,
            codec: Arc::new(gravity_record::JsonCodec::new()),
            output: Arc::new(NoopOutput),
            dlq: None,
        }
    }

    fn start(builder: ProcessorBuilder) -> Self {
        let config = builder.config;
        let workers = config.worker_count;
        let lane_capacity = config.stage_channel_capacity();

        let ctx = Arc::new(PipelineContext {
            product: builder.product,
            rule_manager: builder.rule_manager,
            codec: builder.codec,
            output: builder.output,
            dlq: builder.dlq,
            retry: config.retry.clone(),
            warned_fields: Mutex::new(FxHashSet::default()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (admission_tx, admission_rx) = mpsc::channel(config.queue_depth);

        let mut emit_txs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers * 2 + 1);
        for idx in 0..workers {
            let (tx, rx) = mpsc::channel::<ChildMessage>(lane_capacity);
            emit_txs.push(tx);
            handles.push(tokio::spawn(run_emit_worker(
                idx,
                rx,
                Arc::clone(&ctx),
                shutdown_rx.clone(),
            )));
        }

        let mut transform_txs = Vec::with_capacity(workers);
        for idx in 0..workers {
            let (tx, rx) = mpsc::channel::<Message>(lane_capacity);
            transform_txs.push(tx);
            handles.push(tokio::spawn(run_transform_worker(
                idx,
                rx,
                emit_txs.clone(),
                Arc::clone(&ctx),
                shutdown_rx.clone(),
                config.script_timeout,
            )));
        }
        drop(emit_txs);

        handles.push(tokio::spawn(run_router(
            admission_rx,
            transform_txs,
            Arc::clone(&ctx),
            shutdown_rx,
        )));

        debug!(
            product = %ctx.product,
            workers,
            queue_depth = config.queue_depth,
            "processor started"
        );

        Self {
            admission: Mutex::new(Some(admission_tx)),
            handles: Mutex::new(handles),
            shutdown_tx,
        }
    }

    /// Enqueues a message. Blocks only while the bounded admission queue
    /// is full; returns once the message is accepted.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Shutdown` if the processor is closing.
    pub async fn push(&self, message: Message) -> Result<()> {
        let sender = self
            .admission
            .lock()
            .clone()
            .ok_or(DispatchError::Shutdown)?;
        sender
            .send(message)
            .await
            .map_err(|_| DispatchError::Shutdown)
    }

    /// Drains and stops the pipeline.
    ///
    /// New pushes are rejected immediately. In-flight messages get up to
    /// `drain_timeout` to finish; whatever remains is failed with a
    /// shutdown error and NACKed back to the bus.
    pub async fn close(&self, drain_timeout: Duration) {
        self.admission.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        let mut drain = join_all(handles);
        match tokio::time::timeout(drain_timeout, &mut drain).await {
            Ok(_) => {
                debug!("processor drained cleanly");
            }
            Err(_) => {
                info!("drain timeout expired, force-closing in-flight messages");
                let _ = self.shutdown_tx.send(true);
                // Workers fail their remaining queues with a shutdown NACK.
                // A handler stuck in external I/O can still pin its worker;
                // don't let that pin close() too.
                if tokio::time::timeout(drain_timeout, &mut drain).await.is_err() {
                    warn!("pipeline workers still busy after forced shutdown");
                }
            }
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("closed", &self.admission.lock().is_none())
            .finish_non_exhaustive()
    }
}

// ── Parse stage ─────────────────────────────────────────────────────

/// Single router task: parse in admission order, route by decoded PK.
async fn run_router(
    mut rx: mpsc::Receiver<Message>,
    transform_txs: Vec<mpsc::Sender<Message>>,
    ctx: Arc<PipelineContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => return, // admission closed, clean drain
            },
        };

        route_message(message, &transform_txs, &ctx, &mut shutdown_rx).await;
        if *shutdown_rx.borrow() {
            break;
        }
    }

    // Forced shutdown: fail whatever is still queued.
    rx.close();
    while let Some(message) = rx.recv().await {
        message.delivery.nack().await;
    }
}

async fn route_message(
    mut message: Message,
    transform_txs: &[mpsc::Sender<Message>],
    ctx: &PipelineContext,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    match parse_message(ctx, &mut message) {
        Ok(()) => {
            let lane = routing_lane(&message, transform_txs.len());
            // Reserve a slot rather than send, so a forced shutdown can
            // interrupt a stalled hand-off without losing the message.
            let slot = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => None,
                permit = transform_txs[lane].reserve() => permit.ok(),
            };
            match slot {
                Some(permit) => permit.send(message),
                None => message.delivery.nack().await,
            }
        }
        Err(err) => {
            let event = message.rule.as_ref().map(|r| r.event.clone());
            ctx.report_failure(&message.raw, event.as_deref(), Stage::Parse, &err);
            message.delivery.ack().await;
        }
    }
}

/// Unmarshal the raw envelope, resolve the rule, and decode the payload.
fn parse_message(ctx: &PipelineContext, message: &mut Message) -> Result<()> {
    let raw_data: MessageRawData = serde_json::from_slice(&message.raw)
        .map_err(|e| DispatchError::BadInput(format!("bad raw message: {e}")))?;

    let rule = match &message.rule {
        Some(rule) => Arc::clone(rule),
        None => {
            let resolved = ctx
                .rule_manager
                .as_ref()
                .and_then(|m| m.get_rule(&ctx.product, &raw_data.event));
            match resolved {
                Some(rule) => rule,
                None => {
                    return Err(DispatchError::NoRule {
                        product: ctx.product.clone(),
                        event: raw_data.event,
                    })
                }
            }
        }
    };

    let decoded = rule.schema.decode(&raw_data.raw_payload)?;
    ctx.warn_dropped_fields(&decoded.warnings);

    message.record = Some(decoded.record);
    message.partial = decoded.partial;
    message.rule = Some(rule);
    Ok(())
}

/// Lane assignment from the decoded record's PK fields. A record whose PK
/// is incomplete routes by whatever components are present; the definitive
/// missing-PK check happens at projection.
fn routing_lane(message: &Message, lanes: usize) -> usize {
    let (Some(rule), Some(record)) = (&message.rule, &message.record) else {
        return 0;
    };
    let key = partial_pk_text(record, &rule.primary_key);
    jump_consistent_hash(pk_hash(&key), lanes as u32) as usize
}

fn partial_pk_text(record: &Record, primary_key: &[String]) -> String {
    let mut text = String::new();
    for (i, field) in primary_key.iter().enumerate() {
        if i > 0 {
            text.push(PK_SEPARATOR);
        }
        if let Some(value) = record.get(field) {
            text.push_str(&value.pk_text());
        }
    }
    text
}

// ── Transform stage ─────────────────────────────────────────────────

/// One transform lane: runs the rule handler, fans children out to emit
/// lanes by their own PKs, and tracks group completion.
async fn run_transform_worker(
    idx: usize,
    mut rx: mpsc::Receiver<Message>,
    emit_txs: Vec<mpsc::Sender<ChildMessage>>,
    ctx: Arc<PipelineContext>,
    mut shutdown_rx: watch::Receiver<bool>,
    script_timeout: Duration,
) {
    let transformer = Transformer::new(script_timeout);
    debug!(worker = idx, "transform worker started");

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        transform_message(message, &transformer, &emit_txs, &ctx, &mut shutdown_rx).await;
        if *shutdown_rx.borrow() {
            break;
        }
    }

    rx.close();
    while let Some(message) = rx.recv().await {
        message.delivery.nack().await;
    }
}

async fn transform_message(
    mut message: Message,
    transformer: &Transformer,
    emit_txs: &[mpsc::Sender<ChildMessage>],
    ctx: &PipelineContext,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (Some(rule), Some(record)) = (message.rule.clone(), message.record.take()) else {
        message.delivery.ack().await;
        return;
    };

    let outputs = match transformer.transform(&rule, record) {
        Ok(outputs) => outputs,
        Err(err) => {
            ctx.report_failure(&message.raw, Some(&rule.event), Stage::Transform, &err);
            message.delivery.ack().await;
            return;
        }
    };

    if outputs.is_empty() {
        // Filter drop: a successful no-op.
        message.delivery.ack().await;
        return;
    }

    let completion = Completion::new(Arc::clone(&message.delivery), outputs.len());
    for record in outputs {
        let key = partial_pk_text(&record, &rule.primary_key);
        let lane = jump_consistent_hash(pk_hash(&key), emit_txs.len() as u32) as usize;
        let child = ChildMessage {
            raw: message.raw.clone(),
            msg_id: message.msg_id.clone(),
            rule: Arc::clone(&rule),
            record,
            partial: message.partial,
            completion: Arc::clone(&completion),
        };
        let slot = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => None,
            permit = emit_txs[lane].reserve() => permit.ok(),
        };
        match slot {
            Some(permit) => permit.send(child),
            None => child.completion.child_nack().await,
        }
    }
}

// ── Emit stage ──────────────────────────────────────────────────────

/// One emit lane: project, compute the primary key, encode, and hand the
/// event to the output handler with retry on transient failures.
async fn run_emit_worker(
    idx: usize,
    mut rx: mpsc::Receiver<ChildMessage>,
    ctx: Arc<PipelineContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker = idx, "emit worker started");

    loop {
        let child = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            child = rx.recv() => match child {
                Some(child) => child,
                None => return,
            },
        };

        emit_child(child, &ctx, &mut shutdown_rx).await;
        if *shutdown_rx.borrow() {
            break;
        }
    }

    rx.close();
    while let Some(child) = rx.recv().await {
        child.completion.child_nack().await;
    }
}

async fn emit_child(
    child: ChildMessage,
    ctx: &PipelineContext,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let rule = Arc::clone(&child.rule);

    let (stage, result) = match build_event(ctx, &rule, child.record, child.partial) {
        Ok((record, event)) => {
            let message = Message {
                raw: child.raw.clone(),
                msg_id: child.msg_id.clone(),
                rule: Some(Arc::clone(&rule)),
                record: Some(record),
                partial: child.partial,
                product_event: Some(event),
                delivery: Arc::new(crate::message::NoopDelivery),
            };
            (Stage::Emit, emit_with_retry(ctx, &message, shutdown_rx).await)
        }
        Err((stage, err)) => (stage, Err(err)),
    };

    match result {
        Ok(()) => child.completion.child_done().await,
        Err(DispatchError::Shutdown) => child.completion.child_nack().await,
        Err(err) => {
            ctx.report_failure(&child.raw, Some(&rule.event), stage, &err);
            child.completion.child_done().await;
        }
    }
}

/// Projection + primary key + encode.
///
/// A full record with any PK component missing fails with `MissingPk`.
/// Partial updates are exempt: the update may legitimately lack (or even
/// delete) key fields, so the key is built from whatever is present.
#[allow(clippy::type_complexity)]
fn build_event(
    ctx: &PipelineContext,
    rule: &Rule,
    record: Record,
    partial: bool,
) -> std::result::Result<(Record, ProductEvent), (Stage, DispatchError)> {
    let projected: Record = record
        .iter()
        .filter(|field| rule.column_enabled(&field.name))
        .cloned()
        .collect();

    let primary_key = if partial {
        partial_pk_text(&projected, &rule.primary_key)
    } else {
        primary_key_text(&projected, &rule.primary_key).map_err(|err| (Stage::Project, err))?
    };
    let partition_key = pk_hash(&primary_key);

    let payload = ctx
        .codec
        .encode_record(&projected)
        .map_err(|err| (Stage::Encode, DispatchError::Codec(err)))?;

    let event = ProductEvent {
        event_name: rule.event.clone(),
        table: rule.product.clone(),
        method: rule.method,
        primary_key,
        partition_key,
        payload,
    };
    Ok((projected, event))
}

/// Joins PK field values with the `0x1F` separator. A missing or null
/// component fails the message; `$removedFields` never participates.
fn primary_key_text(record: &Record, primary_key: &[String]) -> Result<String> {
    let mut text = String::new();
    for (i, field) in primary_key.iter().enumerate() {
        let value = record
            .get(field)
            .filter(|v| !matches!(v, Value::Null))
            .ok_or_else(|| DispatchError::MissingPk(field.clone()))?;
        if i > 0 {
            text.push(PK_SEPARATOR);
        }
        text.push_str(&value.pk_text());
    }
    Ok(text)
}

async fn emit_with_retry(
    ctx: &PipelineContext,
    message: &Message,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut attempt: u32 = 1;
    loop {
        match ctx.output.handle(message).await {
            Ok(()) => return Ok(()),
            Err(DispatchError::Shutdown) => return Err(DispatchError::Shutdown),
            Err(err) if err.is_transient() && attempt < ctx.retry.max_attempts => {
                let backoff = ctx.retry.backoff_for(attempt);
                warn!(
                    product = %ctx.product,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "publish failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => return Err(DispatchError::Shutdown),
                    () = tokio::time::sleep(backoff) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

