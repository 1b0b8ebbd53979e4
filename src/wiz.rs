//! A [`Session`] that talks to Wiz bulbs over UDP.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{Either, select};
use log::{debug, warn};
use serde_json::Value;

use crate::config::TransportConfig;
use crate::errors::Error;
use crate::handle::LifetimeHandle;
use crate::message::{Message, Reply, Serial};
use crate::runtime::{self, AsyncUdpSocket, BoxFuture, Instant, UdpSocket};
use crate::session::Session;

type Result<T> = std::result::Result<T, Error>;

/// Wiz bulbs on the local network.
///
/// Bulbs are found by broadcasting a `registration` message and remembering
/// the address each MAC answered from. Messages to a bulb are resent on the
/// [`RetryOptions`](crate::RetryOptions) schedule until it answers or the
/// message times out.
///
/// # Example
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), wiz_script_rs::Error> {
/// use std::sync::Arc;
/// use wiz_script_rs::{Message, Reference, RunOptions, Target, TransportConfig, WizSession};
///
/// let session = Arc::new(WizSession::new(TransportConfig::default()));
/// let target = Target::new(session.clone());
/// let replies = target
///     .script([Message::get_pilot()])
///     .run_all(Reference::All, RunOptions::default())
///     .await?;
/// for reply in replies {
///     println!("{} is on: {:?}", reply.serial, reply.emitting());
/// }
/// session.close();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WizSession {
    config: TransportConfig,
    stop: LifetimeHandle,
    addresses: Mutex<HashMap<Serial, Ipv4Addr>>,
}

impl WizSession {
    const RECV_TIMEOUT_MS: u64 = 500;

    pub fn new(config: TransportConfig) -> Self {
        WizSession {
            config,
            stop: LifetimeHandle::new(),
            addresses: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Remember where a bulb is, so it can be used without discovery.
    pub fn add_device(&self, serial: Serial, ip: Ipv4Addr) {
        self.addresses.lock().unwrap().insert(serial, ip);
    }

    pub fn address(&self, serial: &Serial) -> Option<Ipv4Addr> {
        self.addresses.lock().unwrap().get(serial).copied()
    }

    /// Abort everything in flight and refuse new work.
    pub fn close(&self) {
        self.stop.cancel();
    }

    async fn bind(broadcast: bool) -> Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::socket("bind", e))?;
        if broadcast {
            socket
                .set_broadcast(true)
                .map_err(|e| Error::socket("set_broadcast", e))?;
        }
        Ok(socket)
    }

    /// Race `work` against the session closing.
    async fn until_closed<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        futures::pin_mut!(work);
        match select(work, self.stop.done()).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => Err(Error::Cancelled),
        }
    }

    async fn broadcast_registration(
        &self,
        wanted: Option<&[Serial]>,
        timeout: Duration,
    ) -> Result<Vec<Serial>> {
        let socket = Self::bind(true).await?;
        let bytes = Message::registration().to_bytes()?;
        let target = SocketAddr::from((self.config.broadcast_address, self.config.port));
        socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| Error::socket("send_to", e))?;

        let mut found: Vec<Serial> = Vec::new();
        let start = Instant::now();
        let mut buffer = vec![0u8; self.config.receive_buffer];
        let recv_timeout = Duration::from_millis(Self::RECV_TIMEOUT_MS);

        while start.elapsed() < timeout {
            let wait = recv_timeout.min(timeout.saturating_sub(start.elapsed()));
            match runtime::timeout(wait, socket.recv_from(&mut buffer)).await {
                Ok(Ok((size, SocketAddr::V4(from)))) => {
                    let Some(serial) = serde_json::from_slice::<Value>(&buffer[..size])
                        .ok()
                        .as_ref()
                        .and_then(registration_serial)
                    else {
                        continue;
                    };
                    self.add_device(serial.clone(), *from.ip());
                    if !found.contains(&serial) {
                        found.push(serial);
                    }
                    if wanted.is_some_and(|w| w.iter().all(|s| found.contains(s))) {
                        break;
                    }
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    warn!("Failed to receive discovery reply: {}", e);
                    runtime::sleep(wait).await;
                }
                Err(_) => continue,
            }
        }

        found.sort();
        debug!("Discovered {} bulb(s): {:?}", found.len(), found);
        Ok(found)
    }

    async fn request(&self, serial: &Serial, message: &Message, timeout: Duration) -> Result<Reply> {
        let ip = match self.address(serial) {
            Some(ip) => ip,
            None => {
                self.broadcast_registration(Some(std::slice::from_ref(serial)), timeout)
                    .await?;
                self.address(serial)
                    .ok_or_else(|| Error::failed_to_find(serial))?
            }
        };

        let socket = Self::bind(false).await?;
        let bytes = message.to_bytes()?;
        let exchange = self.exchange(&socket, SocketAddr::from((ip, self.config.port)), serial, message, &bytes);
        match runtime::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Timed out waiting for {} to answer {}", serial, message.method);
                Err(Error::timed_out(serial, message.method))
            }
        }
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        addr: SocketAddr,
        serial: &Serial,
        message: &Message,
        bytes: &[u8],
    ) -> Result<Reply> {
        let mut buffer = vec![0u8; self.config.receive_buffer];
        let mut gaps = self.config.retry.ticker();

        loop {
            socket
                .send_to(bytes, addr)
                .await
                .map_err(|e| Error::socket("send_to", e))?;

            let deadline = Instant::now();
            let gap = gaps.next();
            loop {
                let received = match gap {
                    Some(gap) => {
                        let left = gap.saturating_sub(deadline.elapsed());
                        match runtime::timeout(left, socket.recv_from(&mut buffer)).await {
                            Ok(received) => received,
                            Err(_) => break,
                        }
                    }
                    None => socket.recv_from(&mut buffer).await,
                };

                let (size, from) = received.map_err(|e| Error::socket("recv_from", e))?;
                if from.ip() != addr.ip() {
                    continue;
                }
                let value = match parse_reply(&buffer[..size]) {
                    Ok(value) => value,
                    Err(err) => {
                        debug!("Ignoring unreadable reply from {}: {}", serial, err);
                        continue;
                    }
                };
                if value.get("method").and_then(Value::as_str) != Some(message.method.as_ref()) {
                    debug!("Ignoring unrelated reply from {}: {}", serial, value);
                    continue;
                }
                return Reply::from_response(serial.clone(), message.method, &value);
            }
            debug!("No reply from {} to {} yet, resending", serial, message.method);
        }
    }
}

impl Session for WizSession {
    fn stop_handle(&self) -> &LifetimeHandle {
        &self.stop
    }

    fn discover<'a>(
        &'a self,
        wanted: Option<&'a [Serial]>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Serial>>> {
        Box::pin(self.until_closed(self.broadcast_registration(wanted, timeout)))
    }

    fn send<'a>(
        &'a self,
        serial: &'a Serial,
        message: &'a Message,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(self.until_closed(self.request(serial, message, timeout)))
    }
}

fn parse_reply(bytes: &[u8]) -> Result<Value> {
    let text = String::from_utf8(bytes.to_vec()).map_err(Error::Utf8Decode)?;
    serde_json::from_str(&text).map_err(Error::json_load)
}

fn registration_serial(value: &Value) -> Option<Serial> {
    value
        .get("result")
        .and_then(|r| r.get("mac"))
        .and_then(Value::as_str)
        .and_then(|mac| mac.parse().ok())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_json::json;

    use super::*;
    use crate::config::RetryOptions;
    use crate::message::Method;

    #[test]
    fn test_registration_serial() {
        let reply = json!({"method": "registration", "env": "pro", "result": {"mac": "a8bb50d46a1c", "success": true}});
        assert_eq!(
            registration_serial(&reply),
            Some(Serial::new("a8bb50d46a1c"))
        );
        assert_eq!(registration_serial(&json!({"result": {}})), None);
        assert_eq!(
            registration_serial(&json!({"result": {"mac": "nope"}})),
            None
        );
    }

    /// A bulb on the loopback interface that ignores the first `ignore` requests.
    async fn loopback_bulb(ignore: usize, answer: Value) -> u16 {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let mut seen = 0;
            loop {
                let (_, from) = socket.recv_from(&mut buffer).await.unwrap();
                seen += 1;
                if seen > ignore {
                    let bytes = serde_json::to_vec(&answer).unwrap();
                    socket.send_to(&bytes, from).await.unwrap();
                }
            }
        });
        port
    }

    /// A bulb that sends junk before every real answer.
    async fn noisy_bulb(answer: Value) -> u16 {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            loop {
                let (_, from) = socket.recv_from(&mut buffer).await.unwrap();
                socket.send_to(&[0xff, 0xfe, 0x00], from).await.unwrap();
                socket.send_to(b"{\"method\": ", from).await.unwrap();
                let bytes = serde_json::to_vec(&answer).unwrap();
                socket.send_to(&bytes, from).await.unwrap();
            }
        });
        port
    }

    #[test]
    fn test_parse_reply() {
        assert!(matches!(parse_reply(&[0xff, 0xfe]), Err(Error::Utf8Decode(_))));
        assert!(parse_reply(b"{\"method\": ").is_err());
        assert_eq!(
            parse_reply(br#"{"method": "getPilot"}"#).unwrap(),
            json!({"method": "getPilot"})
        );
    }

    fn session(port: u16) -> WizSession {
        let config = TransportConfig {
            port,
            retry: RetryOptions {
                timeouts: vec![(0.05, 1.0)],
            },
            ..TransportConfig::default()
        };
        let session = WizSession::new(config);
        session.add_device(Serial::new("a8bb50d46a1c"), Ipv4Addr::LOCALHOST);
        session
    }

    #[tokio::test]
    async fn test_send_retries_until_answered() {
        let port = loopback_bulb(
            2,
            json!({"method": "getPilot", "result": {"mac": "a8bb50d46a1c", "state": true}}),
        )
        .await;
        let session = session(port);

        let reply = session
            .send(
                &Serial::new("a8bb50d46a1c"),
                &Message::get_pilot(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.emitting(), Some(true));
    }

    #[tokio::test]
    async fn test_error_reply_is_a_rejection() {
        let port = loopback_bulb(
            0,
            json!({"method": "setPilot", "error": {"code": -32602, "message": "Invalid params"}}),
        )
        .await;
        let session = session(port);
        let serial = Serial::new("a8bb50d46a1c");

        let err = session
            .send(&serial, &Message::set_pilot(json!({"r": 300})), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::rejected(&serial, Method::SetPilot, "Invalid params")
        );
    }

    #[tokio::test]
    async fn test_unanswered_message_times_out() {
        let port = loopback_bulb(usize::MAX, Value::Null).await;
        let session = session(port);
        let serial = Serial::new("a8bb50d46a1c");

        let err = session
            .send(&serial, &Message::reboot(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, Error::timed_out(&serial, Method::Reboot));
    }

    #[tokio::test]
    async fn test_close_cancels_sends() {
        let port = loopback_bulb(usize::MAX, Value::Null).await;
        let session = std::sync::Arc::new(session(port));
        let serial = Serial::new("a8bb50d46a1c");

        let s = session.clone();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            s.close();
        });

        let err = session
            .send(&serial, &Message::reboot(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_datagrams_are_skipped() {
        let port = noisy_bulb(json!({"method": "getPilot", "result": {"state": false}})).await;
        let session = session(port);

        let reply = session
            .send(
                &Serial::new("a8bb50d46a1c"),
                &Message::get_pilot(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.emitting(), Some(false));
    }
}
