//! Scripts that depend on the current state of each device.

use futures::future;
use futures::stream::StreamExt;
use log::debug;

use crate::errors::Error;
use crate::handle::Completion;
use crate::message::Message;
use crate::runtime::BoxFuture;
use crate::script::{
    FromGenerator, MessageBatch, Procedure, ProcedureArgs, Runnable, ScriptPart, Simplifiable,
    Step,
};

/// Turn each device off if it is on, and on if it is off.
///
/// Every device is asked for its state and toggled on its own, so a slow
/// device doesn't hold up the others.
///
/// # Example
///
/// ```
/// # #[tokio::main]
/// # async fn main() -> Result<(), wiz_script_rs::Error> {
/// use std::sync::Arc;
/// use wiz_script_rs::fake::{FakeDevice, MemorySession};
/// use wiz_script_rs::{PowerToggle, RunOptions, Serial, Target};
///
/// let bulb = FakeDevice::new(Serial::new("d073d5000001")).with_power(true);
/// let target = Target::new(Arc::new(MemorySession::new(vec![bulb.clone()])));
///
/// target
///     .script([PowerToggle::new()])
///     .run_all("d073d5000001", RunOptions::default())
///     .await?;
/// assert!(!bulb.power());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerToggle;

impl PowerToggle {
    pub fn new() -> Self {
        PowerToggle
    }

    pub fn generator(&self) -> FromGenerator {
        FromGenerator::new(|args| Toggle { args, done: false }).per_serial()
    }
}

impl Simplifiable for PowerToggle {
    fn simplified(&self) -> Vec<ScriptPart> {
        vec![ScriptPart::runnable(self.generator())]
    }
}

impl From<PowerToggle> for ScriptPart {
    fn from(toggle: PowerToggle) -> Self {
        ScriptPart::simplifiable(toggle)
    }
}

struct Toggle {
    args: ProcedureArgs,
    done: bool,
}

impl Procedure for Toggle {
    fn resume(&mut self, _previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>, Error>> {
        Box::pin(async move {
            if self.done {
                return Ok(None);
            }
            self.done = true;

            let ProcedureArgs {
                reference,
                session,
                options,
            } = self.args.clone();
            let parts: Vec<ScriptPart> = MessageBatch::new(vec![Message::get_pilot()])
                .run(reference, session, options)
                .filter_map(|reply| future::ready(reply.ok()))
                .filter_map(|reply| {
                    future::ready(reply.emitting().map(|on| {
                        debug!("Turning {} {}", reply.serial, if on { "off" } else { "on" });
                        ScriptPart::from(Message::set_state(!on).to(reply.serial.clone()))
                    }))
                })
                .collect()
                .await;

            Ok((!parts.is_empty()).then_some(Step::Send(parts)))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::catcher::ErrorCatcher;
    use crate::fake::{FakeDevice, MemorySession};
    use crate::message::{Method, Serial};
    use crate::reference::Reference;
    use crate::script::Target;
    use crate::session::RunOptions;

    fn serial(n: u8) -> Serial {
        Serial::new(&format!("d073d50000{:02x}", n))
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_each_device() {
        let on = FakeDevice::new(serial(1)).with_power(true);
        let off = FakeDevice::new(serial(2));
        let session = Arc::new(MemorySession::new(vec![on.clone(), off.clone()]));
        let target = Target::new(session.clone());

        let replies = target
            .script([PowerToggle::new()])
            .run_all(
                Reference::from(vec![serial(1), serial(2)]),
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.is(Method::SetState)));
        assert!(!on.power());
        assert!(off.power());
        assert_eq!(
            session.methods_sent_to(&serial(1)),
            vec![Method::GetPilot, Method::SetState]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_device_is_left_alone() {
        let quiet = FakeDevice::new(serial(1)).with_power(true);
        quiet.ignore(Method::GetPilot);
        let loud = FakeDevice::new(serial(2));
        let session = Arc::new(MemorySession::new(vec![quiet.clone(), loud.clone()]));
        let catcher = ErrorCatcher::collection();

        let replies = Target::new(session.clone())
            .script([PowerToggle::new()])
            .run_all(
                Reference::from(vec![serial(1), serial(2)]),
                RunOptions::default()
                    .with_catcher(catcher.clone())
                    .with_message_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(replies.len(), 1);
        assert!(quiet.power());
        assert!(loud.power());
        assert_eq!(
            catcher.errors(),
            vec![Error::timed_out(&serial(1), Method::GetPilot)]
        );
    }
}
