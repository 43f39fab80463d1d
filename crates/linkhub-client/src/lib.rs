//! Link-side implementation of the linkhub protocol.
//!
//! ```no_run
//! # async fn example() -> Result<(), linkhub_client::LinkError> {
//! use linkhub_client::{Handlers, Link, LinkConfig};
//! use linkhub_core::{Message, MessageTag};
//!
//! let mut handlers = Handlers::new();
//! handlers.on(MessageTag::data("ping"), |_| async {
//!     Ok(Some(Message::data("pong", serde_json::Value::Null)))
//! });
//!
//! let config = LinkConfig::new("ws://127.0.0.1:44444", "telegram".parse().unwrap(), "s3cret");
//! let link = Link::connect(config, handlers).await?;
//! let reply = link.request("discord", Message::data("ping", serde_json::Value::Null)).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

mod handlers;
mod link;

pub use handlers::{Handler, Handlers};
pub use link::{Link, LinkConfig, LinkError, LinkHandle};
