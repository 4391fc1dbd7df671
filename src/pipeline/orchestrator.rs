//! The serial state machine driving sessions through
//! fetch → decode → process → deliver.
//!
//! A single actor task owns the session table, both operation queues, and
//! the rate limiter. Every mutation of session state happens here, making
//! this loop the pipeline's linearization point. Work executed elsewhere
//! (the data loader, the decoding worker, processing jobs) reports back by
//! message; each message carries IDs that are re-resolved against the
//! current tables on arrival, and messages whose session or task is gone are
//! dropped.

use crate::decode::ImageDecodingContext;
use crate::error::LoadError;
use crate::image::{ImageContainer, ImageResponse};
use crate::loader::{ChunkSink, CompletionSink, DataLoadError, FetchHandle, UrlResponse};
use crate::pipeline::decode_worker::{self, DecodeMsg};
use crate::pipeline::delivery::{self, DeliveryJob};
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::session::{Session, SessionId, SessionKey, Subscriber};
use crate::pipeline::stats::StatsInner;
use crate::pipeline::task::{CompletionFn, SharedTaskMetrics, TaskEvents, TaskId};
use crate::pipeline::work_queue::{ItemId, OperationQueue};
use crate::pipeline::PipelineConfig;
use crate::process::{ImageProcessingContext, ImageProcessor};
use crate::request::{ImageRequest, Priority};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A load submitted through the public API.
pub(crate) struct LoadSubmission {
    pub task: TaskId,
    pub request: ImageRequest,
    pub events: TaskEvents,
    pub completion: CompletionFn,
    pub cancelled: Arc<AtomicBool>,
    pub metrics: SharedTaskMetrics,
}

pub(crate) enum PipelineMsg {
    Load(Box<LoadSubmission>),
    Cancel {
        task: TaskId,
    },
    SetPriority {
        task: TaskId,
        priority: Priority,
    },
    /// Bytes arrived from the data loader.
    DataChunk {
        session: SessionId,
        data: Bytes,
        response: UrlResponse,
    },
    /// The data loader finished.
    DataComplete {
        session: SessionId,
        result: Result<(), DataLoadError>,
    },
    /// The decoding worker produced a progressive preview.
    PartialDecoded {
        session: SessionId,
        image: ImageContainer,
    },
    /// The decoding worker ran the final decode.
    FinalDecoded {
        session: SessionId,
        image: Option<ImageContainer>,
    },
    /// A preview processing job finished.
    PartialProcessed {
        session: SessionId,
        item: ItemId,
        image: Option<ImageContainer>,
    },
    /// The final processing job finished.
    FinalProcessed {
        session: SessionId,
        item: ItemId,
        image: Option<ImageContainer>,
    },
    /// Session cancellation reached a queued fetch item.
    AbortFetch {
        item: ItemId,
    },
    /// Session cancellation reached a queued processing item.
    AbortProcessing {
        item: ItemId,
    },
    /// Retry timer for deferred rate-limited launches.
    RateLimiterTick,
}

/// A queued processing job: runs `processor.process(image)` off-context.
struct ProcessingWork {
    session: SessionId,
    processor: Arc<dyn ImageProcessor>,
    image: ImageContainer,
    is_final: bool,
}

enum FetchOutcome {
    Fail(LoadError),
    Decode,
}

/// Spawns the orchestrator actor plus its delivery and decoding workers.
///
/// Returns the submission handle. The actor exits when `shutdown` fires.
pub(crate) fn spawn(
    config: PipelineConfig,
    stats: Arc<StatsInner>,
    shutdown: CancellationToken,
) -> mpsc::UnboundedSender<PipelineMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PipelineMsg>();
    let delivery = delivery::spawn(shutdown.clone());
    let decode = decode_worker::spawn(tx.clone());

    let mut orchestrator = Orchestrator::new(config, tx.clone(), delivery, decode, stats);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => orchestrator.handle(msg),
                    None => break,
                },
            }
        }
    });
    tx
}

struct Orchestrator {
    config: PipelineConfig,
    /// Self-sender, cloned into loader callbacks and cancellation hooks.
    tx: mpsc::UnboundedSender<PipelineMsg>,
    delivery: mpsc::UnboundedSender<DeliveryJob>,
    decode: mpsc::UnboundedSender<DecodeMsg>,
    sessions: HashMap<SessionKey, Session>,
    session_keys: HashMap<SessionId, SessionKey>,
    task_index: HashMap<TaskId, SessionId>,
    fetch_queue: OperationQueue<SessionId>,
    processing_queue: OperationQueue<ProcessingWork>,
    rate_limiter: RateLimiter<SessionId>,
    rate_limiter_retry_scheduled: bool,
    next_session_id: SessionId,
    next_unique_key: u64,
    stats: Arc<StatsInner>,
}

impl Orchestrator {
    fn new(
        config: PipelineConfig,
        tx: mpsc::UnboundedSender<PipelineMsg>,
        delivery: mpsc::UnboundedSender<DeliveryJob>,
        decode: mpsc::UnboundedSender<DecodeMsg>,
        stats: Arc<StatsInner>,
    ) -> Self {
        let fetch_queue = OperationQueue::new(config.fetch_concurrency);
        let processing_queue = OperationQueue::new(config.processing_concurrency);
        let rate_limiter = RateLimiter::new(
            config.rate_limiter_capacity,
            config.rate_limiter_refill_rate,
            Instant::now(),
        );
        Self {
            config,
            tx,
            delivery,
            decode,
            sessions: HashMap::new(),
            session_keys: HashMap::new(),
            task_index: HashMap::new(),
            fetch_queue,
            processing_queue,
            rate_limiter,
            rate_limiter_retry_scheduled: false,
            next_session_id: 0,
            next_unique_key: 0,
            stats,
        }
    }

    fn handle(&mut self, msg: PipelineMsg) {
        match msg {
            PipelineMsg::Load(submission) => self.handle_load(*submission),
            PipelineMsg::Cancel { task } => self.handle_cancel(task),
            PipelineMsg::SetPriority { task, priority } => {
                self.handle_set_priority(task, priority)
            }
            PipelineMsg::DataChunk {
                session,
                data,
                response,
            } => self.handle_data_chunk(session, data, response),
            PipelineMsg::DataComplete { session, result } => {
                self.handle_data_complete(session, result)
            }
            PipelineMsg::PartialDecoded { session, image } => {
                self.handle_partial_decoded(session, image)
            }
            PipelineMsg::FinalDecoded { session, image } => {
                self.handle_final_decoded(session, image)
            }
            PipelineMsg::PartialProcessed {
                session,
                item,
                image,
            } => self.handle_partial_processed(session, item, image),
            PipelineMsg::FinalProcessed {
                session,
                item,
                image,
            } => self.handle_final_processed(session, item, image),
            PipelineMsg::AbortFetch { item } => {
                if !self.fetch_queue.cancel(item) {
                    self.fetch_queue.finish(item);
                }
                self.dispatch_fetch_queue();
            }
            PipelineMsg::AbortProcessing { item } => {
                if !self.processing_queue.cancel(item) {
                    self.processing_queue.finish(item);
                }
                self.dispatch_processing_queue();
            }
            PipelineMsg::RateLimiterTick => self.handle_rate_limiter_tick(),
        }
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        let key = self.session_keys.get(&id)?.clone();
        self.sessions.get_mut(&key)
    }

    // ------------------------------------------------------------------
    // Session resolution
    // ------------------------------------------------------------------

    fn handle_load(&mut self, submission: LoadSubmission) {
        self.stats.record_load();

        // Pre-flight: a task cancelled before this point never joins a
        // session and never triggers a fetch.
        if submission.cancelled.load(Ordering::SeqCst) {
            debug!(task = %submission.task, "dropped before pre-flight");
            return;
        }

        // Memory cache probe.
        if submission.request.is_cache_read_allowed() {
            if let Some(cache) = &self.config.image_cache {
                if let Some(image) = cache.get(&submission.request.cache_key()) {
                    self.stats.record_memory_cache_hit();
                    {
                        let mut metrics = submission.metrics.lock().unwrap();
                        metrics.is_memory_cache_hit = true;
                        metrics.time_completed = Some(Instant::now());
                    }
                    debug!(task = %submission.task, url = submission.request.url(), "memory cache hit");
                    let completion = submission.completion;
                    let cancelled = submission.cancelled;
                    let response = ImageResponse {
                        image,
                        is_from_memory_cache: true,
                    };
                    let _ = self.delivery.send(Box::new(move || {
                        if !cancelled.load(Ordering::SeqCst) {
                            completion(Ok(response));
                        }
                    }));
                    return;
                }
            }
        }

        let key = if self.config.is_deduplication_enabled {
            SessionKey::Load(submission.request.load_key())
        } else {
            self.next_unique_key += 1;
            SessionKey::Unique(self.next_unique_key)
        };

        let (session_id, created) = match self.sessions.get(&key) {
            Some(session) => (session.id, false),
            None => {
                self.next_session_id += 1;
                let id = self.next_session_id;
                self.sessions
                    .insert(key.clone(), Session::new(id, submission.request.clone()));
                self.session_keys.insert(id, key.clone());
                (id, true)
            }
        };
        if created {
            self.stats.record_new_session();
        } else {
            self.stats.record_coalesced_load();
            submission
                .metrics
                .lock()
                .unwrap()
                .was_subscribed_to_existing_session = true;
        }

        let task = submission.task;
        self.task_index.insert(task, session_id);
        let (session_priority, fetch_item) = {
            let Some(session) = self.sessions.get_mut(&key) else {
                return;
            };
            session.subscribers.insert(
                task,
                Subscriber {
                    priority: submission.request.priority(),
                    events: submission.events,
                    completion: Some(submission.completion),
                    metrics: submission.metrics,
                    cancelled: submission.cancelled,
                },
            );
            (session.priority(), session.fetch_item)
        };
        debug!(
            task = %task,
            session = session_id,
            created,
            subscribers = self.sessions.get(&key).map(|s| s.subscribers.len()).unwrap_or(0),
            "task attached"
        );

        if created {
            self.start_fetch(session_id);
        } else if let Some(item) = fetch_item {
            self.fetch_queue.set_priority(item, session_priority);
        }
    }

    // ------------------------------------------------------------------
    // Fetch phase
    // ------------------------------------------------------------------

    fn start_fetch(&mut self, session_id: SessionId) {
        let token = match self.session_mut(session_id) {
            Some(session) => session.cancel_source.token(),
            None => return,
        };
        if self.config.is_rate_limiter_enabled {
            match self.rate_limiter.execute(token, session_id, Instant::now()) {
                Some(session_id) => self.submit_fetch(session_id),
                None => self.schedule_rate_limiter_retry(),
            }
        } else {
            self.submit_fetch(session_id);
        }
    }

    fn schedule_rate_limiter_retry(&mut self) {
        if self.rate_limiter_retry_scheduled {
            return;
        }
        self.rate_limiter_retry_scheduled = true;
        let tx = self.tx.clone();
        let interval = self.rate_limiter.retry_interval();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(PipelineMsg::RateLimiterTick);
        });
    }

    fn handle_rate_limiter_tick(&mut self) {
        self.rate_limiter_retry_scheduled = false;
        for session_id in self.rate_limiter.drain_ready(Instant::now()) {
            self.submit_fetch(session_id);
        }
        if self.rate_limiter.has_pending() {
            self.schedule_rate_limiter_retry();
        }
    }

    fn submit_fetch(&mut self, session_id: SessionId) {
        let (priority, token) = match self.session_mut(session_id) {
            Some(session) if !session.completed => {
                (session.priority(), session.cancel_source.token())
            }
            _ => return,
        };
        let item = self.fetch_queue.push(priority, session_id);
        if let Some(session) = self.session_mut(session_id) {
            session.fetch_item = Some(item);
            session.metrics.time_data_loading_started = Some(Instant::now());
        }
        // Cancellation must reach the queue item even before it starts.
        let tx = self.tx.clone();
        token.register(move || {
            let _ = tx.send(PipelineMsg::AbortFetch { item });
        });
        self.dispatch_fetch_queue();
    }

    fn dispatch_fetch_queue(&mut self) {
        while let Some((item, session_id)) = self.fetch_queue.poll_ready() {
            self.launch_fetch(item, session_id);
        }
    }

    fn launch_fetch(&mut self, item: ItemId, session_id: SessionId) {
        let loader = Arc::clone(&self.config.data_loader);
        let chunk_tx = self.tx.clone();
        let done_tx = self.tx.clone();
        let (request, token) = match self.session_mut(session_id) {
            Some(session) if !session.completed => {
                (session.request.clone(), session.cancel_source.token())
            }
            _ => {
                self.fetch_queue.finish(item);
                return;
            }
        };

        let on_chunk: ChunkSink = Box::new(move |data, response: &UrlResponse| {
            let _ = chunk_tx.send(PipelineMsg::DataChunk {
                session: session_id,
                data,
                response: response.clone(),
            });
        });
        let on_complete: CompletionSink = Box::new(move |result| {
            let _ = done_tx.send(PipelineMsg::DataComplete {
                session: session_id,
                result,
            });
        });

        let handle: Arc<dyn FetchHandle> = Arc::from(loader.load(&request, on_chunk, on_complete));
        token.register(move || handle.cancel());
        debug!(session = session_id, url = request.url(), "fetch started");
    }

    fn handle_data_chunk(&mut self, session_id: SessionId, data: Bytes, response: UrlResponse) {
        let progressive = self.config.is_progressive_decoding_enabled;
        let make_decoder = self.config.make_decoder.clone();
        let registry = Arc::clone(&self.config.decoder_registry);

        let mut progress_jobs: Vec<DeliveryJob> = Vec::new();
        let mut decode_msgs: Vec<DecodeMsg> = Vec::new();
        {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            if session.completed {
                return;
            }
            session.downloaded_byte_count += data.len() as u64;
            session.metrics.downloaded_byte_count = session.downloaded_byte_count;
            if session.response.is_none() {
                session.expected_byte_count = response.expected_content_length;
                session.response = Some(response.clone());
            }

            let completed_bytes = session.downloaded_byte_count;
            let total_bytes = session.expected_byte_count;
            for subscriber in session.subscribers.values() {
                if let Some(on_progress) = &subscriber.events.on_progress {
                    let on_progress = Arc::clone(on_progress);
                    let cancelled = Arc::clone(&subscriber.cancelled);
                    progress_jobs.push(Box::new(move || {
                        if !cancelled.load(Ordering::SeqCst) {
                            on_progress(completed_bytes, total_bytes);
                        }
                    }));
                }
            }

            if !session.has_decoder {
                let context = ImageDecodingContext {
                    request: &session.request,
                    response: &response,
                    data: &data,
                };
                let selected = match &make_decoder {
                    Some(factory) => factory(&context),
                    None => registry.select(&context),
                };
                if let Some(decoder) = selected {
                    session.has_decoder = true;
                    decode_msgs.push(DecodeMsg::Start {
                        session: session_id,
                        decoder,
                        progressive,
                    });
                }
            }

            // Partial decodes only make sense while more bytes are coming,
            // which requires a known total length.
            let attempt_partial = progressive
                && session.has_decoder
                && matches!(
                    session.expected_byte_count,
                    Some(total) if session.downloaded_byte_count < total
                );
            decode_msgs.push(DecodeMsg::Append {
                session: session_id,
                data,
                attempt_partial,
            });
        }
        for job in progress_jobs {
            let _ = self.delivery.send(job);
        }
        for msg in decode_msgs {
            let _ = self.decode.send(msg);
        }
    }

    fn handle_data_complete(
        &mut self,
        session_id: SessionId,
        result: Result<(), DataLoadError>,
    ) {
        let (finished_item, outcome) = {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            if session.completed {
                return;
            }
            session.metrics.time_data_loading_finished = Some(Instant::now());
            let item = session.fetch_item.take();
            let outcome = match result {
                Err(error) => FetchOutcome::Fail(LoadError::DataLoad(error)),
                Ok(())
                    if session.downloaded_byte_count == 0 || !session.has_decoder =>
                {
                    FetchOutcome::Fail(LoadError::DecodingFailed)
                }
                Ok(()) => FetchOutcome::Decode,
            };
            (item, outcome)
        };
        if let Some(item) = finished_item {
            self.fetch_queue.finish(item);
            self.dispatch_fetch_queue();
        }
        match outcome {
            FetchOutcome::Fail(error) => {
                let _ = self.decode.send(DecodeMsg::Discard {
                    session: session_id,
                });
                self.complete_session(session_id, Err(error));
            }
            FetchOutcome::Decode => {
                let _ = self.decode.send(DecodeMsg::Finish {
                    session: session_id,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Decoding results
    // ------------------------------------------------------------------

    fn handle_partial_decoded(&mut self, session_id: SessionId, image: ImageContainer) {
        let make_processor = self.config.make_processor.clone();
        enum Action {
            Broadcast,
            Process(Arc<dyn ImageProcessor>, Priority),
        }
        let action = {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            if session.completed {
                return;
            }
            // Back-pressure: prefer the next, fresher partial over queueing.
            if session.partial_op.is_some() {
                trace!(session = session_id, "partial dropped, processing busy");
                return;
            }
            let context = ImageProcessingContext {
                request: &session.request,
                is_final: false,
                scan_number: image.scan_number,
            };
            let processor = match &make_processor {
                Some(factory) => factory(&context),
                None => session.request.processor().cloned(),
            };
            match processor {
                None => Action::Broadcast,
                Some(processor) => Action::Process(processor, session.priority()),
            }
        };
        match action {
            Action::Broadcast => self.broadcast_partial(session_id, image),
            Action::Process(processor, priority) => {
                let item = self.processing_queue.push(
                    priority,
                    ProcessingWork {
                        session: session_id,
                        processor,
                        image,
                        is_final: false,
                    },
                );
                let tx = self.tx.clone();
                if let Some(session) = self.session_mut(session_id) {
                    session.partial_op = Some(item);
                    session.cancel_source.token().register(move || {
                        let _ = tx.send(PipelineMsg::AbortProcessing { item });
                    });
                }
                self.dispatch_processing_queue();
            }
        }
    }

    fn handle_final_decoded(&mut self, session_id: SessionId, image: Option<ImageContainer>) {
        let make_processor = self.config.make_processor.clone();
        enum Next {
            Fail,
            Deliver(ImageContainer),
            Process(Arc<dyn ImageProcessor>, ImageContainer, Priority),
        }
        let next = {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            if session.completed {
                return;
            }
            session.metrics.time_decoding_finished = Some(Instant::now());
            match image {
                None => Next::Fail,
                Some(image) => {
                    let context = ImageProcessingContext {
                        request: &session.request,
                        is_final: true,
                        scan_number: image.scan_number,
                    };
                    let processor = match &make_processor {
                        Some(factory) => factory(&context),
                        None => session.request.processor().cloned(),
                    };
                    match processor {
                        None => Next::Deliver(image),
                        Some(processor) => Next::Process(processor, image, session.priority()),
                    }
                }
            }
        };
        match next {
            Next::Fail => self.complete_session(session_id, Err(LoadError::DecodingFailed)),
            Next::Deliver(image) => self.complete_session(session_id, Ok(image)),
            Next::Process(processor, image, priority) => {
                let item = self.processing_queue.push(
                    priority,
                    ProcessingWork {
                        session: session_id,
                        processor,
                        image,
                        is_final: true,
                    },
                );
                let tx = self.tx.clone();
                if let Some(session) = self.session_mut(session_id) {
                    session.final_op = Some(item);
                    session.cancel_source.token().register(move || {
                        let _ = tx.send(PipelineMsg::AbortProcessing { item });
                    });
                }
                self.dispatch_processing_queue();
            }
        }
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    fn dispatch_processing_queue(&mut self) {
        while let Some((item, work)) = self.processing_queue.poll_ready() {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let ProcessingWork {
                    session,
                    processor,
                    image,
                    is_final,
                } = work;
                let processed =
                    tokio::task::spawn_blocking(move || processor.process(&image))
                        .await
                        .ok()
                        .flatten();
                let msg = if is_final {
                    PipelineMsg::FinalProcessed {
                        session,
                        item,
                        image: processed,
                    }
                } else {
                    PipelineMsg::PartialProcessed {
                        session,
                        item,
                        image: processed,
                    }
                };
                let _ = tx.send(msg);
            });
        }
    }

    fn handle_partial_processed(
        &mut self,
        session_id: SessionId,
        item: ItemId,
        image: Option<ImageContainer>,
    ) {
        // Slot release is unconditional: the session may already be gone.
        self.processing_queue.finish(item);
        self.dispatch_processing_queue();

        {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            if session.partial_op == Some(item) {
                session.partial_op = None;
            }
            if session.completed {
                return;
            }
        }
        if let Some(mut image) = image {
            image.is_preview = true;
            self.broadcast_partial(session_id, image);
        }
    }

    fn handle_final_processed(
        &mut self,
        session_id: SessionId,
        item: ItemId,
        image: Option<ImageContainer>,
    ) {
        self.processing_queue.finish(item);
        self.dispatch_processing_queue();

        {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            if session.final_op == Some(item) {
                session.final_op = None;
            }
            if session.completed {
                return;
            }
        }
        match image {
            Some(mut image) => {
                image.is_preview = false;
                self.complete_session(session_id, Ok(image));
            }
            None => self.complete_session(session_id, Err(LoadError::ProcessingFailed)),
        }
    }

    fn broadcast_partial(&mut self, session_id: SessionId, image: ImageContainer) {
        let mut jobs: Vec<DeliveryJob> = Vec::new();
        {
            let Some(session) = self.session_mut(session_id) else {
                return;
            };
            for subscriber in session.subscribers.values() {
                if let Some(on_partial) = &subscriber.events.on_partial {
                    let on_partial = Arc::clone(on_partial);
                    let cancelled = Arc::clone(&subscriber.cancelled);
                    let image = image.clone();
                    jobs.push(Box::new(move || {
                        if !cancelled.load(Ordering::SeqCst) {
                            on_partial(image);
                        }
                    }));
                }
            }
        }
        for job in jobs {
            let _ = self.delivery.send(job);
        }
    }

    // ------------------------------------------------------------------
    // Completion fan-out
    // ------------------------------------------------------------------

    fn complete_session(&mut self, session_id: SessionId, result: Result<ImageContainer, LoadError>) {
        let Some(key) = self.session_keys.get(&session_id).cloned() else {
            return;
        };
        // Remove only if the stored entry is still this session instance;
        // a replacement session under the same key is left alone.
        if self.sessions.get(&key).map(|s| s.id) != Some(session_id) {
            return;
        }
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };
        self.session_keys.remove(&session_id);
        session.completed = true;
        session.metrics.time_completed = Some(Instant::now());

        // A still-queued preview job is pointless now.
        if let Some(item) = session.partial_op.take() {
            self.processing_queue.cancel(item);
        }

        if let Ok(image) = &result {
            if session.request.is_cache_write_allowed() {
                if let Some(cache) = &self.config.image_cache {
                    cache.set(session.request.cache_key(), image.clone());
                }
            }
        }

        let response = result.map(|image| ImageResponse {
            image,
            is_from_memory_cache: false,
        });
        let now = Instant::now();
        let subscriber_count = session.subscribers.len();
        for (task_id, mut subscriber) in session.subscribers.drain() {
            self.task_index.remove(&task_id);
            subscriber.metrics.lock().unwrap().time_completed = Some(now);
            if let Some(completion) = subscriber.completion.take() {
                let cancelled = Arc::clone(&subscriber.cancelled);
                let response = response.clone();
                let _ = self.delivery.send(Box::new(move || {
                    if !cancelled.load(Ordering::SeqCst) {
                        completion(response);
                    }
                }));
            }
        }

        self.stats.record_session_completed();
        debug!(
            session = session_id,
            ok = response.is_ok(),
            subscribers = subscriber_count,
            bytes = session.metrics.downloaded_byte_count,
            elapsed_ms = session
                .metrics
                .duration()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            "session completed"
        );
    }

    // ------------------------------------------------------------------
    // Cancellation and priority
    // ------------------------------------------------------------------

    fn handle_cancel(&mut self, task: TaskId) {
        // Unknown task: already delivered, already cancelled, or dropped in
        // pre-flight. Idempotent either way.
        let Some(session_id) = self.task_index.remove(&task) else {
            return;
        };
        let Some(key) = self.session_keys.get(&session_id).cloned() else {
            return;
        };
        let mut teardown = false;
        let mut reprioritize = None;
        if let Some(session) = self.sessions.get_mut(&key) {
            if let Some(subscriber) = session.subscribers.remove(&task) {
                let mut metrics = subscriber.metrics.lock().unwrap();
                metrics.was_cancelled = true;
                metrics.time_completed = Some(Instant::now());
            }
            debug!(task = %task, session = session_id, remaining = session.subscribers.len(), "task cancelled");
            if session.subscribers.is_empty() && !session.completed {
                teardown = true;
            } else if let Some(item) = session.fetch_item {
                reprioritize = Some((item, session.priority()));
            }
        }
        if teardown {
            self.teardown_session(session_id, &key);
        } else if let Some((item, priority)) = reprioritize {
            self.fetch_queue.set_priority(item, priority);
        }
    }

    fn teardown_session(&mut self, session_id: SessionId, key: &SessionKey) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        self.session_keys.remove(&session_id);
        session.metrics.was_cancelled = true;
        // Fires the registered hooks: fetch-handle cancel plus abort
        // messages for queued fetch/processing items.
        session.cancel_source.cancel();
        let _ = self.decode.send(DecodeMsg::Discard {
            session: session_id,
        });
        self.stats.record_session_cancelled();
        debug!(session = session_id, "session torn down, last subscriber left");
    }

    fn handle_set_priority(&mut self, task: TaskId, priority: Priority) {
        let Some(&session_id) = self.task_index.get(&task) else {
            return;
        };
        let mut update = None;
        if let Some(session) = self.session_mut(session_id) {
            match session.subscribers.get_mut(&task) {
                Some(subscriber) if subscriber.priority != priority => {
                    subscriber.priority = priority;
                }
                _ => return,
            }
            if let Some(item) = session.fetch_item {
                update = Some((item, session.priority()));
            }
        }
        if let Some((item, priority)) = update {
            self.fetch_queue.set_priority(item, priority);
        }
    }
}
