use std::sync::Arc;

use futures::future;
use futures::stream::{self, FuturesUnordered, StreamExt};
use log::warn;

use super::{ReplyStream, Runnable};
use crate::catcher::ErrorScope;
use crate::errors::Error;
use crate::message::{Message, Serial};
use crate::reference::{Reference, find_serials};
use crate::session::{RunOptions, Session};

/// Messages sent together.
///
/// Every message goes to every device in the reference at the same time,
/// except messages with a target, which only go to that device. Replies come
/// back in the order devices answer. The run's [`SendLimit`](crate::SendLimit)
/// caps how many of those sends wait for a reply at once.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(messages: Vec<Message>) -> Self {
        MessageBatch { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

impl Runnable for MessageBatch {
    fn run(
        &self,
        reference: Option<Reference>,
        session: Arc<dyn Session>,
        options: RunOptions,
    ) -> ReplyStream {
        let messages = self.messages.clone();
        stream::once(dispatch(messages, reference, session, options))
            .flatten()
            .boxed()
    }
}

async fn dispatch(
    messages: Vec<Message>,
    reference: Option<Reference>,
    session: Arc<dyn Session>,
    options: RunOptions,
) -> ReplyStream {
    let errors = ErrorScope::new(options.error_catcher.as_ref());
    let catcher = errors.catcher().clone();

    let (targeted, untargeted): (Vec<Message>, Vec<Message>) =
        messages.into_iter().partition(|m| m.target.is_some());

    let mut work: Vec<(Serial, Message)> = targeted
        .into_iter()
        .filter_map(|m| m.target.clone().map(|serial| (serial, m)))
        .collect();

    if !untargeted.is_empty() {
        let reference = match reference {
            Some(reference) => Some(reference),
            None if options.broadcast => Some(Reference::All),
            None => {
                warn!(
                    "Not sending {} message(s) without a reference or target",
                    untargeted.len()
                );
                None
            }
        };

        if let Some(reference) = reference {
            match find_serials(&reference, session.as_ref(), options.find_timeout).await {
                Ok((found, missing)) => {
                    for serial in &missing {
                        catcher.add(Error::failed_to_find(serial));
                    }
                    for serial in found {
                        for message in &untargeted {
                            work.push((serial.clone(), message.clone()));
                        }
                    }
                }
                Err(err) => catcher.add(err),
            }
        }
    }

    let timeout = options.message_timeout;
    let requests: FuturesUnordered<_> = work
        .into_iter()
        .map(|(serial, message)| {
            let session = Arc::clone(&session);
            let limit = options.limit.clone();
            async move {
                let _permit = match &limit {
                    Some(limit) => Some(limit.acquire().await),
                    None => None,
                };
                session.send(&serial, &message, timeout).await
            }
        })
        .collect();

    let replies = requests.filter_map(move |result| {
        future::ready(match result {
            Ok(reply) => Some(Ok(reply)),
            Err(err) => {
                catcher.add(err);
                None
            }
        })
    });
    let raised = stream::once(async move { errors.into_error() })
        .filter_map(future::ready)
        .map(Err);

    replies.chain(raised).boxed()
}
