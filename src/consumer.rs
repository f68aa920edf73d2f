//! Message consumers.

use crate::error::Result;
use crate::message::Message;
use futures::future::BoxFuture;
use std::future::Future;

/// Handler bound to a stream with `register`.
///
/// Returning `Ok(())` acknowledges the message. Returning an error asks the
/// backend to deliver it again, so handlers must be idempotent or
/// deduplicate on `message.id`.
///
/// Any `Fn(Message) -> impl Future<Output = Result<()>>` closure is a
/// consumer:
///
/// ```
/// use cache_queue::{Consumer, Message, Result};
///
/// fn assert_consumer<C: Consumer>(_: C) {}
///
/// assert_consumer(|message: Message| async move {
///     println!("got {}", message.id);
///     Result::Ok(())
/// });
/// ```
pub trait Consumer: Send + Sync + 'static {
    fn consume(&self, message: Message) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Consumer for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn consume(&self, message: Message) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(message))
    }
}
