//! In-process notifications and the ordered handler chain
//!
//! An [`Event`] is owned by whoever posts it and lent by `&mut` to each
//! handler in turn. A handler either consumes it, which ends the walk, or
//! forwards it to the next handler. Handlers are kept in a
//! [`HandlerChain`] and addressed by a stable [`HandlerId`].

use std::any::Any;
use std::fmt;

use crate::connection::ConnId;

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(pub u32);

impl EventType {
    /// A command finished successfully; payload carries a [`CommandNotice`]
    pub const COMMAND_OK: Self = Self(1);
    /// A command failed; payload carries a [`CommandNotice`]
    pub const COMMAND_FAILED: Self = Self(2);
    /// Count device clients that cannot wait; payload is a counter
    pub const QUERY_WAIT: Self = Self(3);
    /// Every device client enters the move wait
    pub const ENTER_WAIT: Self = Self(4);
    /// Every device client leaves any wait state
    pub const CLEAR_WAIT: Self = Self(5);
    /// Toggle quick enable on mounts; payload is a flag
    pub const QUICK_ENABLE: Self = Self(6);

    /// First type available to applications
    pub const LOCAL: Self = Self(500);

    /// Application defined type, offset from [`EventType::LOCAL`]
    pub const fn local(offset: u32) -> Self {
        Self(Self::LOCAL.0 + offset)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::COMMAND_OK => f.write_str("command_ok"),
            Self::COMMAND_FAILED => f.write_str("command_failed"),
            Self::QUERY_WAIT => f.write_str("query_wait"),
            Self::ENTER_WAIT => f.write_str("enter_wait"),
            Self::CLEAR_WAIT => f.write_str("clear_wait"),
            Self::QUICK_ENABLE => f.write_str("quick_enable"),
            Self(n) => write!(f, "event#{}", n),
        }
    }
}

/// What a finished command reports back to its originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandNotice {
    pub text: String,
    pub conn: Option<ConnId>,
    pub status: i32,
}

/// Event payload
pub enum EventPayload {
    None,
    Count(i32),
    Flag(bool),
    Command(CommandNotice),
    Text(String),
    Conn(ConnId),
    Custom(Box<dyn Any>),
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Self::Flag(b) => f.debug_tuple("Flag").field(b).finish(),
            Self::Command(c) => f.debug_tuple("Command").field(c).finish(),
            Self::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Self::Conn(c) => f.debug_tuple("Conn").field(c).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A tagged notification
#[derive(Debug)]
pub struct Event {
    kind: EventType,
    payload: EventPayload,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(kind: EventType, payload: EventPayload) -> Self {
        Self { kind, payload }
    }

    pub fn kind(&self) -> EventType {
        self.kind
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut EventPayload {
        &mut self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    /// Counter payload, if any.
    pub fn count(&self) -> Option<i32> {
        match self.payload {
            EventPayload::Count(n) => Some(n),
            _ => None,
        }
    }

    /// Bump a counter payload; other payloads are left alone.
    pub fn increment_count(&mut self) {
        if let EventPayload::Count(n) = &mut self.payload {
            *n += 1;
        }
    }

    pub fn flag(&self) -> Option<bool> {
        match self.payload {
            EventPayload::Flag(b) => Some(b),
            _ => None,
        }
    }

    pub fn command_notice(&self) -> Option<&CommandNotice> {
        match &self.payload {
            EventPayload::Command(n) => Some(n),
            _ => None,
        }
    }
}

/// Result of offering an event to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Stop the walk
    Consumed,
    /// Offer the event to the next handler
    Forward,
}

/// Stable identity of a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Where an event, timer or command completion is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    /// Every connection's device client, then the handler chain
    Block,
    /// One connection's device client
    Connection(ConnId),
    /// One handler of the chain
    Handler(HandlerId),
}

/// Receives events posted to the chain.
///
/// `C` is the context handed to each call, normally the [`crate::Block`].
pub trait EventHandler<C: ?Sized> {
    fn handle(&mut self, ctx: &mut C, event: &mut Event) -> Handled;
}

impl<C: ?Sized, F> EventHandler<C> for F
where
    F: FnMut(&mut C, &mut Event) -> Handled,
{
    fn handle(&mut self, ctx: &mut C, event: &mut Event) -> Handled {
        self(ctx, event)
    }
}

/// Ordered list of handlers.
///
/// While a dispatch is running the owner detaches the chain (see
/// [`HandlerChain::detach`]); additions and removals made meanwhile land in
/// the staging chain and are applied by [`HandlerChain::reattach`].
pub struct HandlerChain<C: ?Sized> {
    handlers: Vec<(HandlerId, Box<dyn EventHandler<C>>)>,
    removed: Vec<HandlerId>,
    next_id: u64,
}

impl<C: ?Sized> Default for HandlerChain<C> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            removed: Vec::new(),
            next_id: 0,
        }
    }
}

impl<C: ?Sized> fmt::Debug for HandlerChain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.ids())
            .field("removed", &self.removed)
            .finish()
    }
}

impl<C: ?Sized> HandlerChain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; it sees events after every handler added before it.
    pub fn add(&mut self, handler: impl EventHandler<C> + 'static) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns false when it is not in this chain, in
    /// which case the removal is remembered for [`HandlerChain::reattach`].
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        if self.handlers.len() == before {
            if !self.removed.contains(&id) {
                self.removed.push(id);
            }
            false
        } else {
            true
        }
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.iter().any(|(h, _)| *h == id)
    }

    pub fn ids(&self) -> Vec<HandlerId> {
        self.handlers.iter().map(|(h, _)| *h).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Walk the chain in order until a handler consumes the event.
    pub fn dispatch(&mut self, ctx: &mut C, event: &mut Event) -> Handled {
        for (_, handler) in self.handlers.iter_mut() {
            if handler.handle(ctx, event) == Handled::Consumed {
                return Handled::Consumed;
            }
        }
        Handled::Forward
    }

    /// Offer the event to one handler only; `None` when the id is unknown.
    pub fn dispatch_to(&mut self, id: HandlerId, ctx: &mut C, event: &mut Event) -> Option<Handled> {
        self.handlers
            .iter_mut()
            .find(|(h, _)| *h == id)
            .map(|(_, handler)| handler.handle(ctx, event))
    }

    /// Take the handlers out, leaving an empty staging chain that keeps
    /// allocating fresh ids.
    pub fn detach(&mut self) -> Self {
        let staging = Self {
            handlers: Vec::new(),
            removed: Vec::new(),
            next_id: self.next_id,
        };
        std::mem::replace(self, staging)
    }

    /// Put a detached chain back, applying what was staged meanwhile.
    pub fn reattach(&mut self, chain: Self) {
        let staging = std::mem::replace(self, chain);
        self.next_id = self.next_id.max(staging.next_id);
        for id in &staging.removed {
            self.handlers.retain(|(h, _)| h != id);
        }
        self.handlers.extend(staging.handlers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        seen: Vec<&'static str>,
    }

    fn recorder(name: &'static str, result: Handled) -> impl FnMut(&mut Trace, &mut Event) -> Handled {
        move |ctx: &mut Trace, _event: &mut Event| {
            ctx.seen.push(name);
            result
        }
    }

    // ==================== Event Tests ====================

    #[test]
    fn test_event_counter_payload() {
        let mut event = Event::with_payload(EventType::QUERY_WAIT, EventPayload::Count(0));
        event.increment_count();
        event.increment_count();
        assert_eq!(event.count(), Some(2));
    }

    #[test]
    fn test_increment_ignores_other_payloads() {
        let mut event = Event::with_payload(EventType::QUICK_ENABLE, EventPayload::Flag(true));
        event.increment_count();
        assert_eq!(event.flag(), Some(true));
        assert_eq!(event.count(), None);
    }

    #[test]
    fn test_custom_payload_downcast() {
        let event = Event::with_payload(EventType::local(3), EventPayload::Custom(Box::new(42u16)));
        assert_eq!(event.kind(), EventType(503));
        match event.into_payload() {
            EventPayload::Custom(b) => assert_eq!(b.downcast_ref::<u16>(), Some(&42)),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::COMMAND_OK.to_string(), "command_ok");
        assert_eq!(EventType::local(1).to_string(), "event#501");
    }

    // ==================== Chain Tests ====================

    #[test]
    fn test_dispatch_walks_in_order_until_consumed() {
        let mut chain = HandlerChain::<Trace>::new();
        chain.add(recorder("a", Handled::Forward));
        chain.add(recorder("b", Handled::Consumed));
        chain.add(recorder("c", Handled::Forward));

        let mut trace = Trace::default();
        let mut event = Event::new(EventType::local(0));
        assert_eq!(chain.dispatch(&mut trace, &mut event), Handled::Consumed);
        assert_eq!(trace.seen, vec!["a", "b"]);
    }

    #[test]
    fn test_dispatch_forwarded_by_all() {
        let mut chain = HandlerChain::<Trace>::new();
        chain.add(recorder("a", Handled::Forward));
        let mut trace = Trace::default();
        let mut event = Event::new(EventType::local(0));
        assert_eq!(chain.dispatch(&mut trace, &mut event), Handled::Forward);
    }

    #[test]
    fn test_handlers_mutate_shared_event() {
        let mut chain = HandlerChain::<()>::new();
        for _ in 0..3 {
            chain.add(|_: &mut (), event: &mut Event| {
                event.increment_count();
                Handled::Forward
            });
        }
        let mut event = Event::with_payload(EventType::QUERY_WAIT, EventPayload::Count(0));
        chain.dispatch(&mut (), &mut event);
        assert_eq!(event.count(), Some(3));
    }

    #[test]
    fn test_remove_and_dispatch_to() {
        let mut chain = HandlerChain::<Trace>::new();
        let a = chain.add(recorder("a", Handled::Forward));
        let b = chain.add(recorder("b", Handled::Forward));

        assert!(chain.remove(a));
        assert!(!chain.contains(a));

        let mut trace = Trace::default();
        let mut event = Event::new(EventType::local(0));
        assert_eq!(chain.dispatch_to(b, &mut trace, &mut event), Some(Handled::Forward));
        assert_eq!(chain.dispatch_to(a, &mut trace, &mut event), None);
        assert_eq!(trace.seen, vec!["b"]);
    }

    #[test]
    fn test_detach_and_reattach_merges_staged_changes() {
        let mut chain = HandlerChain::<Trace>::new();
        let a = chain.add(recorder("a", Handled::Forward));
        let b = chain.add(recorder("b", Handled::Forward));

        let detached = chain.detach();
        assert!(chain.is_empty());

        // changes made while detached
        let c = chain.add(recorder("c", Handled::Forward));
        assert!(!chain.remove(a));
        assert!(c > b);

        chain.reattach(detached);
        assert_eq!(chain.ids(), vec![b, c]);

        // ids keep growing after the merge
        let d = chain.add(recorder("d", Handled::Forward));
        assert!(d > c);
    }
}
