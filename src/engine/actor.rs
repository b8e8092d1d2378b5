//! Actor that serializes access to the prompt cache.
//!
//! The orchestrator, and with it the cache, lives on one dedicated OS thread.
//! Callers talk to it through a [`OrchestratorHandle`]; generations stream back
//! through a [`TextStream`].
//!
//! ```text
//! ┌──────────────┐   crossbeam channel   ┌───────────────────────┐
//! │   Callers    │ ──── Command ────────>│ Prompt cache actor    │
//! │              │ <─── StreamEvent ─────│ (dedicated thread)    │
//! │  TextStream  │   per-request channel │ Owns: orchestrator,   │
//! │              │                       │ cache, model handles  │
//! └──────────────┘                       └───────────────────────┘
//! ```
//!
//! Commands that arrive while a generation runs are drained between decode
//! steps: cache clears and stats queries are answered right away, further
//! generations are queued. A stream whose buffer is full pauses its
//! generation, and the actor keeps answering commands until the consumer
//! catches up, drops the stream, or the actor is shut down.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GenerationObserver, GenerationOrchestrator, GenerationRequest, GenerationStats};
use crate::cache::{CacheManager, CacheStats, CacheStatus};
use crate::error::{PromptCacheError, Result};

/// Text chunks buffered per stream before the actor blocks.
const STREAM_BUFFER: usize = 64;

/// Commands queued to the actor.
const COMMAND_BUFFER: usize = 16;

struct GenerationJob {
    request: GenerationRequest,
    cancel: CancellationToken,
    events: Sender<StreamEvent>,
}

enum ActorCommand {
    Generate(GenerationJob),
    ClearCache,
    Stats(Sender<CacheStats>),
    Status(Sender<Option<CacheStatus>>),
    Shutdown,
}

enum StreamEvent {
    Chunk(String),
    Finished(GenerationStats),
    Failed(PromptCacheError),
}

/// Handle to the prompt cache actor.
pub struct OrchestratorHandle {
    cmd_tx: Sender<ActorCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Move the orchestrator onto a dedicated thread.
    pub fn spawn(orchestrator: GenerationOrchestrator) -> Result<Self> {
        let (cmd_tx, cmd_rx) = bounded::<ActorCommand>(COMMAND_BUFFER);

        let thread = thread::Builder::new()
            .name("prompt-cache-actor".into())
            .spawn(move || actor_loop(orchestrator, cmd_rx))?;

        Ok(OrchestratorHandle {
            cmd_tx,
            thread: Some(thread),
        })
    }

    /// Queue a generation and stream its text.
    pub fn generate(&self, request: GenerationRequest) -> Result<TextStream> {
        let (events_tx, events_rx) = bounded(STREAM_BUFFER);
        let cancel = CancellationToken::new();
        self.send(ActorCommand::Generate(GenerationJob {
            request,
            cancel: cancel.clone(),
            events: events_tx,
        }))?;
        Ok(TextStream {
            events: events_rx,
            cancel,
            stats: None,
            done: false,
        })
    }

    /// Discard the cached entry. Safe while a generation is running.
    pub fn clear_cache(&self) -> Result<()> {
        self.send(ActorCommand::ClearCache)
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        let (tx, rx) = bounded(1);
        self.send(ActorCommand::Stats(tx))?;
        rx.recv().map_err(|_| PromptCacheError::ActorClosed)
    }

    pub fn cache_status(&self) -> Result<Option<CacheStatus>> {
        let (tx, rx) = bounded(1);
        self.send(ActorCommand::Status(tx))?;
        rx.recv().map_err(|_| PromptCacheError::ActorClosed)
    }

    /// Stop the actor, cancelling the running generation.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn send(&self, command: ActorCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| PromptCacheError::ActorClosed)
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(ActorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("prompt cache actor panicked");
            }
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Text of one generation, chunk by chunk.
///
/// Iteration blocks until the next chunk arrives. Dropping the stream cancels
/// the generation; tokens produced so far are still cached.
pub struct TextStream {
    events: Receiver<StreamEvent>,
    cancel: CancellationToken,
    stats: Option<GenerationStats>,
    done: bool,
}

impl TextStream {
    /// Stop the generation after the current step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Available once the stream has been drained.
    pub fn stats(&self) -> Option<&GenerationStats> {
        self.stats.as_ref()
    }

    /// Drain the stream into one string.
    pub fn collect_text(&mut self) -> Result<String> {
        let mut text = String::new();
        for chunk in self.by_ref() {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Iterator for TextStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.events.recv() {
            Ok(StreamEvent::Chunk(chunk)) => Some(Ok(chunk)),
            Ok(StreamEvent::Finished(stats)) => {
                self.stats = Some(stats);
                self.done = true;
                None
            }
            Ok(StreamEvent::Failed(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Err(_) => {
                self.done = true;
                Some(Err(PromptCacheError::ActorClosed))
            }
        }
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

/// Streams chunks to the caller and drains commands between decode steps.
struct ActorObserver<'a> {
    events: &'a Sender<StreamEvent>,
    cancel: &'a CancellationToken,
    commands: &'a Receiver<ActorCommand>,
    queued: &'a mut VecDeque<GenerationJob>,
    /// Chunks that did not fit in the stream buffer.
    pending: VecDeque<StreamEvent>,
    closed: bool,
    shutdown: bool,
}

impl<'a> ActorObserver<'a> {
    fn new(
        job: &'a GenerationJob,
        commands: &'a Receiver<ActorCommand>,
        queued: &'a mut VecDeque<GenerationJob>,
    ) -> Self {
        ActorObserver {
            events: &job.events,
            cancel: &job.cancel,
            commands,
            queued,
            pending: VecDeque::new(),
            closed: false,
            shutdown: false,
        }
    }

    fn handle(&mut self, command: ActorCommand, cache: &mut CacheManager) {
        match command {
            ActorCommand::Generate(job) => self.queued.push_back(job),
            ActorCommand::ClearCache => {
                debug!("clearing prompt cache mid-generation");
                cache.invalidate();
            }
            ActorCommand::Stats(reply) => {
                let _ = reply.send(cache.stats().clone());
            }
            ActorCommand::Status(reply) => {
                let _ = reply.send(cache.status());
            }
            ActorCommand::Shutdown => self.stop(),
        }
    }

    fn stop(&mut self) {
        self.shutdown = true;
        self.cancel.cancel();
    }

    /// Send `event` to the stream, serving commands while its buffer is full.
    ///
    /// Returns `false` if the stream is gone, or still full after shutdown.
    fn deliver(&mut self, mut event: StreamEvent, cache: &mut CacheManager) -> bool {
        let (events, commands) = (self.events, self.commands);
        loop {
            match events.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => event = back,
            }
            if self.shutdown {
                return false;
            }

            let mut select = Select::new();
            select.send(events);
            let command_ready = select.recv(commands);
            if select.ready() == command_ready {
                match commands.try_recv() {
                    Ok(command) => self.handle(command, cache),
                    // All handles dropped
                    Err(TryRecvError::Disconnected) => self.stop(),
                    Err(TryRecvError::Empty) => {}
                }
            }
        }
    }

    /// Deliver the chunks held back while the stream was full.
    fn flush(&mut self, cache: &mut CacheManager) {
        while let Some(event) = self.pending.pop_front() {
            if !self.deliver(event, cache) {
                self.pending.clear();
                self.closed = true;
                self.cancel.cancel();
            }
        }
    }
}

impl GenerationObserver for ActorObserver<'_> {
    fn on_chunk(&mut self, chunk: String) -> ControlFlow<()> {
        if self.closed {
            return ControlFlow::Break(());
        }
        if !self.pending.is_empty() {
            self.pending.push_back(StreamEvent::Chunk(chunk));
            return ControlFlow::Continue(());
        }
        match self.events.try_send(StreamEvent::Chunk(chunk)) {
            Ok(()) => ControlFlow::Continue(()),
            Err(TrySendError::Full(event)) => {
                self.pending.push_back(event);
                ControlFlow::Continue(())
            }
            // A closed stream means the consumer went away.
            Err(TrySendError::Disconnected(_)) => ControlFlow::Break(()),
        }
    }

    fn between_tokens(&mut self, cache: &mut CacheManager) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle(command, cache);
        }
        self.flush(cache);
    }
}

fn actor_loop(mut orchestrator: GenerationOrchestrator, cmd_rx: Receiver<ActorCommand>) {
    let mut queued: VecDeque<GenerationJob> = VecDeque::new();

    loop {
        let command = match queued.pop_front() {
            Some(job) => ActorCommand::Generate(job),
            None => match cmd_rx.recv() {
                Ok(command) => command,
                // All handles dropped
                Err(_) => break,
            },
        };

        match command {
            ActorCommand::Generate(job) => {
                if job.cancel.is_cancelled() {
                    debug!("skipping generation cancelled before it started");
                    continue;
                }
                let mut observer = ActorObserver::new(&job, &cmd_rx, &mut queued);
                let result = orchestrator.generate(&job.request, &job.cancel, &mut observer);

                let event = match result {
                    Ok(stats) => StreamEvent::Finished(stats),
                    Err(e) => StreamEvent::Failed(e),
                };
                observer.flush(orchestrator.cache_mut());
                if !observer.closed {
                    observer.deliver(event, orchestrator.cache_mut());
                }
                if observer.shutdown {
                    break;
                }
            }
            ActorCommand::ClearCache => orchestrator.clear_cache(),
            ActorCommand::Stats(reply) => {
                let _ = reply.send(orchestrator.cache_stats());
            }
            ActorCommand::Status(reply) => {
                let _ = reply.send(orchestrator.cache_status());
            }
            ActorCommand::Shutdown => break,
        }
    }

    for job in queued {
        let _ = job
            .events
            .try_send(StreamEvent::Failed(PromptCacheError::ActorClosed));
    }
    debug!("prompt cache actor stopped");
}
