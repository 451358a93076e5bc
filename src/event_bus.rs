use std::sync::mpsc::Receiver;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) session_active_handlers: Vec<HandlerPtr<SessionActiveEvent>>,
    pub(crate) session_ended_handlers: Vec<HandlerPtr<SessionEndedEvent>>,
    pub(crate) state_changed_handlers: Vec<HandlerPtr<StateChangedEvent>>,
    pub(crate) transaction_granted_handlers: Vec<HandlerPtr<TransactionGrantedEvent>>,
    pub(crate) transaction_deferred_handlers: Vec<HandlerPtr<TransactionDeferredEvent>>,
    pub(crate) save_completed_handlers: Vec<HandlerPtr<SaveCompletedEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(
        log_events: bool,
        on_session_active: Option<HandlerPtr<SessionActiveEvent>>,
        on_session_ended: Option<HandlerPtr<SessionEndedEvent>>,
        on_state_changed: Option<HandlerPtr<StateChangedEvent>>,
        on_transaction_granted: Option<HandlerPtr<TransactionGrantedEvent>>,
        on_transaction_deferred: Option<HandlerPtr<TransactionDeferredEvent>>,
        on_save_completed: Option<HandlerPtr<SaveCompletedEvent>>,
    ) -> EventHandlers {
        let mut event_handlers = EventHandlers {
            session_active_handlers: Vec::new(),
            session_ended_handlers: Vec::new(),
            state_changed_handlers: Vec::new(),
            transaction_granted_handlers: Vec::new(),
            transaction_deferred_handlers: Vec::new(),
            save_completed_handlers: Vec::new(),
        };

        if log_events {
            event_handlers.session_active_handlers.push(SessionActiveEvent::get_logger());
            event_handlers.session_ended_handlers.push(SessionEndedEvent::get_logger());
            event_handlers.state_changed_handlers.push(StateChangedEvent::get_logger());
            event_handlers.transaction_granted_handlers.push(TransactionGrantedEvent::get_logger());
            event_handlers.transaction_deferred_handlers.push(TransactionDeferredEvent::get_logger());
            event_handlers.save_completed_handlers.push(SaveCompletedEvent::get_logger());
        }

        if let Some(handler) = on_session_active {
            event_handlers.session_active_handlers.push(handler)
        }
        if let Some(handler) = on_session_ended {
            event_handlers.session_ended_handlers.push(handler)
        }
        if let Some(handler) = on_state_changed {
            event_handlers.state_changed_handlers.push(handler)
        }
        if let Some(handler) = on_transaction_granted {
            event_handlers.transaction_granted_handlers.push(handler)
        }
        if let Some(handler) = on_transaction_deferred {
            event_handlers.transaction_deferred_handlers.push(handler)
        }
        if let Some(handler) = on_save_completed {
            event_handlers.save_completed_handlers.push(handler)
        }

        event_handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.session_active_handlers.is_empty()
            && self.session_ended_handlers.is_empty()
            && self.state_changed_handlers.is_empty()
            && self.transaction_granted_handlers.is_empty()
            && self.transaction_deferred_handlers.is_empty()
            && self.save_completed_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::SessionActive(session_active_event) => self
                .session_active_handlers
                .iter()
                .for_each(|handler| handler(&session_active_event)),

            Event::SessionEnded(session_ended_event) => self
                .session_ended_handlers
                .iter()
                .for_each(|handler| handler(&session_ended_event)),

            Event::StateChanged(state_changed_event) => self
                .state_changed_handlers
                .iter()
                .for_each(|handler| handler(&state_changed_event)),

            Event::TransactionGranted(transaction_granted_event) => self
                .transaction_granted_handlers
                .iter()
                .for_each(|handler| handler(&transaction_granted_event)),

            Event::TransactionDeferred(transaction_deferred_event) => self
                .transaction_deferred_handlers
                .iter()
                .for_each(|handler| handler(&transaction_deferred_event)),

            Event::SaveCompleted(save_completed_event) => self
                .save_completed_handlers
                .iter()
                .for_each(|handler| handler(&save_completed_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => {
                panic!("the event publisher was disconnected from the channel")
            }
        }
    })
}
