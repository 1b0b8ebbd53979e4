//! In-memory devices for tests and demos.
//!
//! A [`MemorySession`] answers messages the way Wiz bulbs do, without a
//! network. Each [`FakeDevice`] can be taken offline or told to delay, ignore
//! or reject particular methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{Either, pending, select};
use serde_json::{Value, json};

use crate::errors::Error;
use crate::handle::LifetimeHandle;
use crate::message::{Message, Method, Reply, Serial};
use crate::runtime::{self, BoxFuture, Instant};
use crate::session::Session;

type Result<T> = std::result::Result<T, Error>;

/// How a fake device treats one method.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Answer after a delay.
    Delay(Duration),
    /// Never answer.
    Ignore,
    /// Answer with an error.
    Reject(String),
    /// Answer once the handle is resolved.
    Gate(LifetimeHandle),
}

#[derive(Debug)]
struct DeviceState {
    online: bool,
    power: bool,
    dimming: u64,
    behaviours: HashMap<Method, Behaviour>,
}

/// A device living in memory.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    serial: Serial,
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new(serial: Serial) -> Self {
        FakeDevice {
            serial,
            state: Arc::new(Mutex::new(DeviceState {
                online: true,
                power: false,
                dimming: 100,
                behaviours: HashMap::new(),
            })),
        }
    }

    pub fn with_power(self, on: bool) -> Self {
        self.state.lock().unwrap().power = on;
        self
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().unwrap().online
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    pub fn power(&self) -> bool {
        self.state.lock().unwrap().power
    }

    pub fn dimming(&self) -> u64 {
        self.state.lock().unwrap().dimming
    }

    pub fn behave(&self, method: Method, behaviour: Behaviour) {
        self.state
            .lock()
            .unwrap()
            .behaviours
            .insert(method, behaviour);
    }

    pub fn delay(&self, method: Method, delay: Duration) {
        self.behave(method, Behaviour::Delay(delay));
    }

    pub fn ignore(&self, method: Method) {
        self.behave(method, Behaviour::Ignore);
    }

    pub fn reject(&self, method: Method, reason: &str) {
        self.behave(method, Behaviour::Reject(reason.to_string()));
    }

    /// Hold answers to `method` until the returned handle is resolved.
    pub fn gate(&self, method: Method) -> LifetimeHandle {
        let gate = LifetimeHandle::new();
        self.behave(method, Behaviour::Gate(gate.clone()));
        gate
    }

    pub fn behave_normally(&self, method: Method) {
        self.state.lock().unwrap().behaviours.remove(&method);
    }

    async fn answer(&self, message: &Message) -> std::result::Result<Value, String> {
        let behaviour = {
            let state = self.state.lock().unwrap();
            if !state.online {
                None
            } else {
                Some(state.behaviours.get(&message.method).cloned())
            }
        };

        match behaviour {
            None | Some(Some(Behaviour::Ignore)) => pending().await,
            Some(Some(Behaviour::Reject(reason))) => return Err(reason),
            Some(Some(Behaviour::Delay(delay))) => runtime::sleep(delay).await,
            Some(Some(Behaviour::Gate(gate))) => {
                gate.done().await;
            }
            Some(None) => {}
        }

        Ok(self.apply(message))
    }

    fn apply(&self, message: &Message) -> Value {
        let mut state = self.state.lock().unwrap();
        let params = message.params.as_ref();
        match message.method {
            Method::GetPilot => json!({
                "mac": self.serial,
                "state": state.power,
                "dimming": state.dimming,
            }),
            Method::SetPilot | Method::SetState => {
                if let Some(on) = params.and_then(|p| p.get("state")).and_then(Value::as_bool) {
                    state.power = on;
                }
                if let Some(dimming) = params.and_then(|p| p.get("dimming")).and_then(Value::as_u64) {
                    state.dimming = dimming;
                }
                json!({ "success": true })
            }
            Method::GetSystemConfig => json!({
                "mac": self.serial,
                "moduleName": "ESP01_SHRGB1C_31",
                "fwVersion": "1.25.0",
            }),
            Method::GetPower => json!({ "power": if state.power { 8500 } else { 0 } }),
            Method::Registration => json!({ "mac": self.serial, "success": true }),
            Method::Reboot | Method::Reset | Method::GetUserConfig | Method::GetModelConfig => {
                json!({ "success": true })
            }
        }
    }
}

/// A request a [`MemorySession`] received.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub serial: Serial,
    pub method: Method,
    /// Time since the session was created.
    pub at: Duration,
}

/// A [`Session`] backed by [`FakeDevice`]s.
#[derive(Debug)]
pub struct MemorySession {
    stop: LifetimeHandle,
    devices: Vec<FakeDevice>,
    started: Instant,
    requests: Mutex<Vec<Request>>,
}

impl MemorySession {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        MemorySession {
            stop: LifetimeHandle::new(),
            devices,
            started: Instant::now(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn devices(&self) -> &[FakeDevice] {
        &self.devices
    }

    pub fn device(&self, serial: &Serial) -> Option<&FakeDevice> {
        self.devices.iter().find(|d| d.serial() == serial)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// The methods sent to one device, in the order they were received.
    pub fn methods_sent_to(&self, serial: &Serial) -> Vec<Method> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.serial == serial)
            .map(|r| r.method)
            .collect()
    }

    /// Cancel everything in flight, as a real session does when closed.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn online(&self) -> Vec<Serial> {
        self.devices
            .iter()
            .filter(|d| d.is_online())
            .map(|d| d.serial().clone())
            .collect()
    }
}

impl Session for MemorySession {
    fn stop_handle(&self) -> &LifetimeHandle {
        &self.stop
    }

    fn discover<'a>(
        &'a self,
        wanted: Option<&'a [Serial]>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Serial>>> {
        Box::pin(async move {
            let online = self.online();
            let complete = wanted.is_some_and(|w| w.iter().all(|s| online.contains(s)));
            if !complete {
                // Discovery only gives up on missing devices once it times out.
                let wait = runtime::sleep(timeout);
                futures::pin_mut!(wait);
                if let Either::Right(_) = select(wait, self.stop.done()).await {
                    return Err(Error::Cancelled);
                }
            }
            Ok(online)
        })
    }

    fn send<'a>(
        &'a self,
        serial: &'a Serial,
        message: &'a Message,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(Request {
                serial: serial.clone(),
                method: message.method,
                at: self.started.elapsed(),
            });

            let device = self.device(serial);
            let answer = async move {
                match device {
                    Some(device) => device.answer(message).await,
                    None => pending().await,
                }
            };
            let work = runtime::timeout(timeout, answer);
            futures::pin_mut!(work);

            match select(work, self.stop.done()).await {
                Either::Left((Ok(Ok(result)), _)) => {
                    Ok(Reply::new(serial.clone(), message.method, result))
                }
                Either::Left((Ok(Err(reason)), _)) => {
                    Err(Error::rejected(serial, message.method, &reason))
                }
                Either::Left((Err(_), _)) => Err(Error::timed_out(serial, message.method)),
                Either::Right(_) => Err(Error::Cancelled),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(n: u8) -> Serial {
        Serial::new(&format!("d073d50000{:02x}", n))
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_and_applies_messages() {
        let session = MemorySession::new(vec![FakeDevice::new(serial(1))]);
        let timeout = Duration::from_secs(1);

        let reply = session
            .send(&serial(1), &Message::set_state(true), timeout)
            .await
            .unwrap();
        assert!(reply.is(Method::SetState));

        let reply = session
            .send(&serial(1), &Message::get_pilot(), timeout)
            .await
            .unwrap();
        assert_eq!(reply.emitting(), Some(true));
        assert_eq!(
            session.methods_sent_to(&serial(1)),
            vec![Method::SetState, Method::GetPilot]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures() {
        let device = FakeDevice::new(serial(1));
        let session = MemorySession::new(vec![device.clone()]);
        let timeout = Duration::from_secs(1);

        device.ignore(Method::GetPilot);
        let start = Instant::now();
        assert_eq!(
            session.send(&serial(1), &Message::get_pilot(), timeout).await,
            Err(Error::timed_out(&serial(1), Method::GetPilot))
        );
        assert!(start.elapsed() >= timeout);

        device.reject(Method::Reboot, "not today");
        assert_eq!(
            session.send(&serial(1), &Message::reboot(), timeout).await,
            Err(Error::rejected(&serial(1), Method::Reboot, "not today"))
        );

        assert_eq!(
            session.send(&serial(9), &Message::reboot(), timeout).await,
            Err(Error::timed_out(&serial(9), Method::Reboot))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_sends() {
        let device = FakeDevice::new(serial(1));
        let session = Arc::new(MemorySession::new(vec![device.clone()]));
        let _gate = device.gate(Method::GetPilot);

        let s = session.clone();
        let sent = runtime::spawn(async move {
            s.send(&serial(1), &Message::get_pilot(), Duration::from_secs(60))
                .await
        });
        runtime::sleep(Duration::from_millis(5)).await;
        session.stop();
        assert_eq!(sent.await, Err(Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_waits_for_missing_devices() {
        let session = MemorySession::new(vec![FakeDevice::new(serial(1))]);
        let start = Instant::now();

        let found = session
            .discover(Some(&[serial(1)][..]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, vec![serial(1)]);
        assert!(start.elapsed() < Duration::from_secs(1));

        let found = session
            .discover(Some(&[serial(1), serial(2)][..]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, vec![serial(1)]);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
