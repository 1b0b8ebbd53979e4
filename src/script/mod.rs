//! Scripts: what gets sent to which devices, and in what order.
//!
//! A script is a list of [`ScriptPart`]s. Plain [`Message`]s next to each other
//! are grouped into one [`MessageBatch`]; everything else already knows how to
//! run itself, or how to turn itself into parts that do.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::errors::Error;
use crate::message::{Message, Reply};
use crate::reference::Reference;
use crate::session::{RunOptions, Session};

mod batch;
mod combinators;
mod generator;
mod target;

pub use batch::MessageBatch;
pub use combinators::{LoopHook, Pipeline, Repeater};
pub use generator::{FromGenerator, Procedure, ProcedureArgs, ReferenceOverride, Step};
pub use target::{ScriptRunner, Target};

/// The replies of one run.
///
/// Failures go to the run's error catcher. Without one, the stream ends with a
/// single [`Error::RunErrors`] once all work has unwound.
pub type ReplyStream = BoxStream<'static, Result<Reply, Error>>;

/// A part of a script that can run against a reference.
pub trait Runnable: Send + Sync {
    /// Run against `reference`.
    ///
    /// Without a reference, only messages that name their own target are sent,
    /// unless `options.broadcast` is set.
    fn run(
        &self,
        reference: Option<Reference>,
        session: Arc<dyn Session>,
        options: RunOptions,
    ) -> ReplyStream;
}

/// A part of a script that is expressed in terms of other parts.
pub trait Simplifiable: Send + Sync {
    fn simplified(&self) -> Vec<ScriptPart>;
}

/// One element of a script.
#[derive(Clone)]
pub enum ScriptPart {
    Message(Message),
    Runnable(Arc<dyn Runnable>),
    Simplifiable(Arc<dyn Simplifiable>),
}

impl ScriptPart {
    pub fn runnable(runnable: impl Runnable + 'static) -> Self {
        ScriptPart::Runnable(Arc::new(runnable))
    }

    pub fn simplifiable(simplifiable: impl Simplifiable + 'static) -> Self {
        ScriptPart::Simplifiable(Arc::new(simplifiable))
    }
}

impl From<Message> for ScriptPart {
    fn from(message: Message) -> Self {
        ScriptPart::Message(message)
    }
}

impl fmt::Debug for ScriptPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptPart::Message(message) => f.debug_tuple("Message").field(message).finish(),
            ScriptPart::Runnable(_) => f.write_str("Runnable"),
            ScriptPart::Simplifiable(_) => f.write_str("Simplifiable"),
        }
    }
}

/// Reduce `parts` to the runnables that execute them.
///
/// Simplifiable parts are expanded recursively and every run of adjacent
/// messages becomes one [`MessageBatch`]. Order is preserved.
pub fn simplify(parts: impl IntoIterator<Item = ScriptPart>) -> Vec<Arc<dyn Runnable>> {
    let mut runnables: Vec<Arc<dyn Runnable>> = Vec::new();
    let mut group: Vec<Message> = Vec::new();
    for part in parts {
        expand(part, &mut runnables, &mut group);
    }
    flush(&mut runnables, &mut group);
    runnables
}

fn expand(part: ScriptPart, runnables: &mut Vec<Arc<dyn Runnable>>, group: &mut Vec<Message>) {
    match part {
        ScriptPart::Message(message) => group.push(message),
        ScriptPart::Runnable(runnable) => {
            flush(runnables, group);
            runnables.push(runnable);
        }
        ScriptPart::Simplifiable(simplifiable) => {
            for part in simplifiable.simplified() {
                expand(part, runnables, group);
            }
        }
    }
}

fn flush(runnables: &mut Vec<Arc<dyn Runnable>>, group: &mut Vec<Message>) {
    if !group.is_empty() {
        runnables.push(Arc::new(MessageBatch::new(std::mem::take(group))));
    }
}
