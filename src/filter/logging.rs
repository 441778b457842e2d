use log::Level;

use crate::{
    pipeline::{Event, Filter, NextFilter, NextWrite, Payload},
    Result,
};

/// Which events a [`LoggingFilter`] reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LogEvents {
    pub created: bool,
    pub opened: bool,
    pub received: bool,
    pub sent: bool,
    pub exception: bool,
    pub idle: bool,
    pub closed: bool,
    pub write: bool,
}

impl LogEvents {
    pub const fn all() -> Self {
        Self {
            created: true,
            opened: true,
            received: true,
            sent: true,
            exception: true,
            idle: true,
            closed: true,
            write: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            created: false,
            opened: false,
            received: false,
            sent: false,
            exception: false,
            idle: false,
            closed: false,
            write: false,
        }
    }

    /// Opened, exception and closed only.
    pub const fn exceptions() -> Self {
        Self {
            opened: true,
            exception: true,
            closed: true,
            ..Self::none()
        }
    }

    fn accepts(&self, event: &Event) -> bool {
        match event {
            Event::SessionCreated => self.created,
            Event::SessionOpened => self.opened,
            Event::MessageReceived(_) => self.received,
            Event::MessageSent(_) => self.sent,
            Event::ExceptionCaught(_) => self.exception,
            Event::SessionIdle(_) => self.idle,
            Event::SessionClosed => self.closed,
        }
    }
}

impl Default for LogEvents {
    fn default() -> Self {
        Self::all()
    }
}

/// Logs the events passing through it, then forwards them unchanged.
///
/// Records go to the `log` facade under a configurable target and level.
pub struct LoggingFilter {
    target: String,
    level: Level,
    events: LogEvents,
    skip_duplicate_exceptions: bool,
    last_exception: Option<String>,
}

impl LoggingFilter {
    /// Logs every event at info level under `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            level: Level::Info,
            events: LogEvents::all(),
            skip_duplicate_exceptions: false,
            last_exception: None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_events(mut self, events: LogEvents) -> Self {
        self.events = events;
        self
    }

    /// Reports an exception only when it differs from the previous one.
    pub fn skip_duplicate_exceptions(mut self) -> Self {
        self.skip_duplicate_exceptions = true;
        self
    }

    fn log_event(&mut self, event: &Event, next: &NextFilter<'_>) {
        let target = self.target.as_str();
        if !self.events.accepts(event) || !log::log_enabled!(target: target, self.level) {
            return;
        }

        let session = next.session();
        match event {
            Event::MessageReceived(payload) => {
                log::log!(target: target, self.level, "[{}] RECEIVED: {}", session, payload)
            }
            Event::MessageSent(message) => log::log!(
                target: target,
                self.level,
                "[{}] SENT: {:?} message ({} bytes)",
                session,
                message.kind,
                message.len()
            ),
            Event::ExceptionCaught(err) => {
                let text = err.to_string();
                if self.skip_duplicate_exceptions && self.last_exception.as_ref() == Some(&text) {
                    return;
                }
                log::log!(target: target, self.level, "[{}] EXCEPTION: {}", session, text);
                self.last_exception = Some(text);
            }
            Event::SessionIdle(status) => {
                log::log!(target: target, self.level, "[{}] IDLE: {:?}", session, status)
            }
            event => log::log!(target: target, self.level, "[{}] {}", session, event.name()),
        }
    }
}

impl Filter for LoggingFilter {
    fn on_event(&mut self, event: Event, next: &mut NextFilter<'_>) -> Result<()> {
        self.log_event(&event, next);
        next.fire(event)
    }

    fn filter_write(&mut self, payload: Payload, next: &mut NextWrite<'_>) -> Result<()> {
        if self.events.write {
            let target = self.target.as_str();
            log::log!(target: target, self.level, "[{}] WRITE: {}", next.session(), payload);
        }
        next.write(payload)
    }
}

/// A [`LoggingFilter`] preset that reports session open, close and exceptions at debug level,
/// and reports a repeated exception only once.
///
/// Installed first in every session's pipeline unless disabled in the options.
pub struct ExceptionLoggingFilter(LoggingFilter);

impl ExceptionLoggingFilter {
    pub fn new(target: impl Into<String>) -> Self {
        Self(
            LoggingFilter::new(target)
                .with_level(Level::Debug)
                .with_events(LogEvents::exceptions())
                .skip_duplicate_exceptions(),
        )
    }
}

impl Filter for ExceptionLoggingFilter {
    fn on_event(&mut self, event: Event, next: &mut NextFilter<'_>) -> Result<()> {
        self.0.on_event(event, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipeline::FilterPipeline, session::SessionState, GatewayError};
    use std::sync::{Arc, Mutex};

    /// Counts the events that made it past the logging filter.
    struct Counter(Arc<Mutex<usize>>);

    impl Filter for Counter {
        fn on_event(&mut self, _event: Event, _next: &mut NextFilter<'_>) -> Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_presets() {
        let exceptions = LogEvents::exceptions();
        assert!(exceptions.opened && exceptions.exception && exceptions.closed);
        assert!(!exceptions.created && !exceptions.received && !exceptions.sent);
        assert!(!exceptions.idle && !exceptions.write);

        assert_eq!(LogEvents::default(), LogEvents::all());
        assert!(!LogEvents::none().accepts(&Event::SessionOpened));
    }

    #[test]
    fn test_forwards_every_event() {
        let _ = simple_logger::init_with_level(log::Level::Trace);

        let count = Arc::new(Mutex::new(0));
        let mut pipeline = FilterPipeline::new();
        pipeline
            .add_last("log", LoggingFilter::new("wsgate::test"))
            .unwrap();
        pipeline
            .add_last("exceptions", ExceptionLoggingFilter::new("wsgate::test"))
            .unwrap();
        pipeline.add_last("count", Counter(Arc::clone(&count))).unwrap();

        let mut state = SessionState::for_test();
        pipeline.fire(&mut state, Event::SessionCreated);
        pipeline.fire(&mut state, Event::SessionOpened);
        pipeline.fire(&mut state, Event::ExceptionCaught(GatewayError::CloseTimeout));
        pipeline.fire(&mut state, Event::ExceptionCaught(GatewayError::CloseTimeout));
        pipeline.fire(&mut state, Event::SessionClosed);

        assert_eq!(*count.lock().unwrap(), 5);
    }
}
