//! Handler table: which function answers which message.

use futures_util::future::BoxFuture;
use linkhub_core::{Message, MessageTag, Package, RequestErrorKind};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Answers one incoming package. `Ok(Some(_))` is sent back to the
/// requester, `Ok(None)` sends nothing, and `Err(_)` is reported to the
/// requester as a [`RequestErrorKind::HandlerFailed`].
pub type Handler =
    Arc<dyn Fn(Package) -> BoxFuture<'static, anyhow::Result<Option<Message>>> + Send + Sync>;

/// Handlers keyed by [`MessageTag`].
#[derive(Clone, Default)]
pub struct Handlers {
    handlers: HashMap<MessageTag, Handler>,
}

impl Handlers {
    /// An empty table. Every request gets a `NoHandler` reply until
    /// something is registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any previous one.
    pub fn register(&mut self, tag: MessageTag, handler: Handler) {
        debug!("Registering handler for {}", tag);
        self.handlers.insert(tag, handler);
    }

    /// Register an async closure.
    pub fn on<F, Fut>(&mut self, tag: MessageTag, handler: F) -> &mut Self
    where
        F: Fn(Package) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
    {
        self.register(tag, Arc::new(move |package| Box::pin(handler(package))));
        self
    }

    /// Whether `tag` has a handler.
    pub fn has_handler(&self, tag: &MessageTag) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `package` and build the reply, if any.
    ///
    /// A missing handler or a failing one becomes a `RequestError` reply with
    /// the same conversation id. Error payloads without a handler are dropped
    /// instead, so two links never bounce errors back and forth.
    pub async fn dispatch(&self, package: Package) -> Option<Package> {
        let tag = package.data.tag();

        let Some(handler) = self.handlers.get(&tag) else {
            if package.data.is_error() {
                debug!("Dropping unhandled {} from {}", tag, package.source);
                return None;
            }
            debug!("No handler for {} from {}", tag, package.source);
            let error = Message::request_error(
                RequestErrorKind::NoHandler,
                format!("no handler for {tag}"),
            );
            return Some(Package::reply_to(&package, error));
        };

        debug!("Dispatching {} from {}", tag, package.source);
        match handler(package.clone()).await {
            Ok(Some(reply)) => Some(Package::reply_to(&package, reply)),
            Ok(None) => None,
            Err(e) => {
                debug!("Handler for {} failed: {:#}", tag, e);
                let error =
                    Message::request_error(RequestErrorKind::HandlerFailed, format!("{e:#}"));
                Some(Package::reply_to(&package, error))
            }
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
