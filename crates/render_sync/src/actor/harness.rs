//! # Actor Harness
//!
//! Runs one [`Actor`] on a dedicated OS thread:
//!
//! ```text
//! initialize
//! while open:
//!     drain control mailbox
//!     drain message mailbox until empty or the message budget is spent
//!     tick
//! cleanup
//! ```
//!
//! The only cross-thread entry point is [`ActorHandle::enqueue_msg`].
//! Message sets are closed enums matched exhaustively by each actor.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::foundation::logging::{debug, error, info};
use crate::foundation::time::Budget;
use crate::sync::{MailboxQueue, OpenFlag};
use super::control::{ControlBus, ControlMailbox, ControlMessage};

/// Default per-cycle mailbox drain budget
pub const DEFAULT_MESSAGE_BUDGET: Duration = Duration::from_micros(7000);

/// Actor lifecycle errors
#[derive(thiserror::Error, Debug)]
pub enum ActorError {
    /// The OS refused to create the actor thread
    #[error("failed to spawn actor thread: {0}")]
    Spawn(#[from] std::io::Error),
    
    /// `initialize` reported a failure
    #[error("actor initialization failed: {0}")]
    Initialize(String),
    
    /// The actor is no longer accepting messages
    #[error("actor {0} is stopped")]
    AlreadyStopped(String),
    
    /// The actor thread panicked
    #[error("actor {0} panicked")]
    Panicked(String),
}

/// Per-actor context passed to every callback
#[derive(Debug, Clone)]
pub struct ActorContext {
    name: Arc<str>,
    open: OpenFlag,
    bus: ControlBus,
}

impl ActorContext {
    pub(crate) fn new(name: &str, open: OpenFlag, bus: ControlBus) -> Self {
        Self { name: Arc::from(name), open, bus }
    }
    
    /// Actor name, also used as the thread name
    pub fn name(&self) -> &str {
        &self.name
    }
    
    /// Check whether the actor should keep running
    pub fn is_open(&self) -> bool {
        self.open.is_open()
    }
    
    /// Flag observed by cancellable waits inside the actor
    pub fn open_flag(&self) -> &OpenFlag {
        &self.open
    }
    
    /// Broadcast a control message to every actor
    pub fn broadcast(&self, message: ControlMessage) {
        self.bus.broadcast(message);
    }
}

/// A subsystem driven by the harness
pub trait Actor: Send + 'static {
    /// Closed set of messages accepted by this actor
    type Message: Send + 'static;
    
    /// Thread and log name
    fn name(&self) -> &str;
    
    /// Maximum time spent draining the mailbox per cycle
    fn message_budget(&self) -> Duration {
        DEFAULT_MESSAGE_BUDGET
    }
    
    /// Sleep after a cycle that handled no message
    fn idle_sleep(&self) -> Duration {
        Duration::from_micros(200)
    }
    
    /// Called once on the actor thread before the loop
    fn initialize(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        Ok(())
    }
    
    /// Handle one mailbox message
    fn handle_message(&mut self, message: Self::Message, ctx: &ActorContext);
    
    /// Handle one control-plane message
    fn handle_control(&mut self, _message: ControlMessage, _ctx: &ActorContext) {}
    
    /// Subsystem work, called once per cycle
    fn tick(&mut self, ctx: &ActorContext);
    
    /// Called once on the actor thread after the loop exits
    fn cleanup(&mut self, _ctx: &ActorContext) {}
}

/// Cloneable, thread-safe sending side of an actor
#[derive(Debug)]
pub struct ActorHandle<M> {
    name: Arc<str>,
    mailbox: Arc<MailboxQueue<M>>,
    open: OpenFlag,
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            mailbox: Arc::clone(&self.mailbox),
            open: self.open.clone(),
        }
    }
}

impl<M: Send> ActorHandle<M> {
    /// Create a detached handle whose mailbox is drained by the caller
    ///
    /// Used to wire an actor against a mailbox read directly in tests.
    pub fn detached(name: &str, initial_blocks: usize) -> (Self, Arc<MailboxQueue<M>>) {
        let mailbox = Arc::new(MailboxQueue::new(initial_blocks));
        let handle = Self {
            name: Arc::from(name),
            mailbox: Arc::clone(&mailbox),
            open: OpenFlag::new(),
        };
        (handle, mailbox)
    }
    
    /// Queue a message for the actor
    pub fn enqueue_msg(&self, message: M) -> Result<(), ActorError> {
        if !self.open.is_open() {
            return Err(ActorError::AlreadyStopped(self.name.to_string()));
        }
        self.mailbox.enqueue(message);
        Ok(())
    }
    
    /// Actor name
    pub fn name(&self) -> &str {
        &self.name
    }
    
    /// Check whether the actor still accepts messages
    pub fn is_open(&self) -> bool {
        self.open.is_open()
    }
    
    /// Messages waiting in the mailbox
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}

/// Owner of a running actor thread
pub struct ActorHost<A: Actor> {
    handle: ActorHandle<A::Message>,
    thread: Option<JoinHandle<Result<A, ActorError>>>,
}

impl<A: Actor> ActorHost<A> {
    /// Spawn the actor thread and open its mailbox
    pub fn start(actor: A, mailbox_blocks: usize, bus: &ControlBus) -> Result<Self, ActorError> {
        let name: Arc<str> = Arc::from(actor.name());
        let mailbox = Arc::new(MailboxQueue::new(mailbox_blocks));
        let open = OpenFlag::new();
        
        let ctx = ActorContext::new(&name, open.clone(), bus.clone());
        let control = bus.subscribe();
        let thread_mailbox = Arc::clone(&mailbox);
        
        info!("Opening actor {name}");
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(actor, &thread_mailbox, &control, &ctx))?;
        
        Ok(Self {
            handle: ActorHandle { name, mailbox, open },
            thread: Some(thread),
        })
    }
    
    /// Sending handle for this actor
    pub fn handle(&self) -> ActorHandle<A::Message> {
        self.handle.clone()
    }
    
    /// Check whether the actor loop is still running
    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }
    
    /// Close the actor, join its thread and return the actor state
    pub fn stop(mut self) -> Result<A, ActorError> {
        self.close_and_join()
            .unwrap_or_else(|| Err(ActorError::AlreadyStopped(self.handle.name.to_string())))
    }
    
    fn close_and_join(&mut self) -> Option<Result<A, ActorError>> {
        let thread = self.thread.take()?;
        info!("Closing actor {}", self.handle.name);
        self.handle.open.close();
        Some(
            thread
                .join()
                .unwrap_or_else(|_| Err(ActorError::Panicked(self.handle.name.to_string()))),
        )
    }
}

impl<A: Actor> Drop for ActorHost<A> {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.close_and_join() {
            error!("Actor {} stopped with error: {e}", self.handle.name);
        }
    }
}

fn run<A: Actor>(
    mut actor: A,
    mailbox: &MailboxQueue<A::Message>,
    control: &ControlMailbox,
    ctx: &ActorContext,
) -> Result<A, ActorError> {
    if let Err(e) = actor.initialize(ctx) {
        error!("Actor {} failed to initialize: {e}", ctx.name());
        ctx.open.close();
        return Err(e);
    }
    debug!("Actor {} initialized", ctx.name());
    
    while ctx.is_open() {
        while let Some(message) = control.pop() {
            actor.handle_control(message, ctx);
        }
        
        let handled = drain(&mut actor, mailbox, ctx);
        actor.tick(ctx);
        
        if handled == 0 {
            let pause = actor.idle_sleep();
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }
    }
    
    actor.cleanup(ctx);
    debug!("Actor {} cleaned up ({} messages left unhandled)", ctx.name(), mailbox.len());
    Ok(actor)
}

fn drain<A: Actor>(actor: &mut A, mailbox: &MailboxQueue<A::Message>, ctx: &ActorContext) -> usize {
    let budget = Budget::start(actor.message_budget());
    let mut handled = 0;
    while let Some(message) = mailbox.pop() {
        actor.handle_message(message, ctx);
        handled += 1;
        if budget.is_exhausted() {
            break;
        }
    }
    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::control::GameState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Message(u32),
        Tick,
        Control,
    }
    
    struct Recorder {
        events: Vec<Event>,
        handled: Arc<AtomicUsize>,
        budget: Duration,
        fail_init: bool,
        cleaned_up: bool,
    }
    
    impl Recorder {
        fn new(budget: Duration) -> (Self, Arc<AtomicUsize>) {
            let handled = Arc::new(AtomicUsize::new(0));
            let recorder = Self {
                events: Vec::new(),
                handled: Arc::clone(&handled),
                budget,
                fail_init: false,
                cleaned_up: false,
            };
            (recorder, handled)
        }
    }
    
    impl Actor for Recorder {
        type Message = u32;
        
        fn name(&self) -> &str {
            "recorder"
        }
        
        fn message_budget(&self) -> Duration {
            self.budget
        }
        
        fn initialize(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
            if self.fail_init {
                return Err(ActorError::Initialize("refused".into()));
            }
            Ok(())
        }
        
        fn handle_message(&mut self, message: u32, _ctx: &ActorContext) {
            self.events.push(Event::Message(message));
            self.handled.fetch_add(1, Ordering::Release);
        }
        
        fn handle_control(&mut self, _message: ControlMessage, _ctx: &ActorContext) {
            self.events.push(Event::Control);
        }
        
        fn tick(&mut self, _ctx: &ActorContext) {
            self.events.push(Event::Tick);
        }
        
        fn cleanup(&mut self, _ctx: &ActorContext) {
            self.cleaned_up = true;
        }
    }
    
    fn wait_for(counter: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while counter.load(Ordering::Acquire) < expected {
            assert!(Instant::now() < deadline, "actor did not handle {expected} messages in time");
            thread::sleep(Duration::from_millis(1));
        }
    }
    
    #[test]
    fn test_messages_handled_in_order_and_cleanup_runs() {
        let bus = ControlBus::new();
        let (recorder, handled) = Recorder::new(DEFAULT_MESSAGE_BUDGET);
        let host = ActorHost::start(recorder, 3, &bus).unwrap();
        let handle = host.handle();
        
        for i in 0..100 {
            handle.enqueue_msg(i).unwrap();
        }
        wait_for(&handled, 100);
        
        let recorder = host.stop().unwrap();
        let messages: Vec<u32> = recorder
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Message(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(messages, (0..100).collect::<Vec<_>>());
        assert!(recorder.cleaned_up);
        assert!(matches!(handle.enqueue_msg(1), Err(ActorError::AlreadyStopped(_))));
    }
    
    #[test]
    fn test_exhausted_budget_yields_to_tick() {
        let bus = ControlBus::new();
        let (recorder, handled) = Recorder::new(Duration::ZERO);
        let host = ActorHost::start(recorder, 3, &bus).unwrap();
        let handle = host.handle();
        
        for i in 0..20 {
            handle.enqueue_msg(i).unwrap();
        }
        wait_for(&handled, 20);
        
        let recorder = host.stop().unwrap();
        for pair in recorder.events.windows(2) {
            let both_messages = matches!(pair, [Event::Message(_), Event::Message(_)]);
            assert!(!both_messages, "two messages handled in one zero-budget cycle");
        }
    }
    
    #[test]
    fn test_control_messages_delivered() {
        let bus = ControlBus::new();
        let (recorder, handled) = Recorder::new(DEFAULT_MESSAGE_BUDGET);
        let host = ActorHost::start(recorder, 1, &bus).unwrap();
        
        bus.broadcast(ControlMessage::StateChange(GameState::Playing));
        host.handle().enqueue_msg(1).unwrap();
        wait_for(&handled, 1);
        
        let recorder = host.stop().unwrap();
        assert!(recorder.events.contains(&Event::Control));
    }
    
    #[test]
    fn test_failed_initialize_closes_actor() {
        let bus = ControlBus::new();
        let (mut recorder, _) = Recorder::new(DEFAULT_MESSAGE_BUDGET);
        recorder.fail_init = true;
        
        let host = ActorHost::start(recorder, 1, &bus).unwrap();
        let result = host.stop();
        assert!(matches!(result, Err(ActorError::Initialize(_))));
    }
}
