//! Client for the relay/sensor board's line-delimited JSON protocol.
//!
//! One request, one response line. The transport is anything that is
//! `AsyncRead + AsyncWrite`; production uses a TCP serial bridge, tests use
//! an in-memory duplex pipe. Every call is bounded by a two second deadline
//! and a failed call drops the link so the next one reconnects.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use greenhouse_common::{Actuator, ClimateStates};

const CALL_TIMEOUT: Duration = Duration::from_secs(2);

pub type BoardLink = Box<dyn AsyncReadWrite>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("board link is not configured")]
    NotConnected,
    #[error("board call timed out")]
    Timeout,
    #[error("board i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed board response: {0}")]
    Malformed(String),
    #[error("board rejected command: {0}")]
    Rejected(String),
}

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request<'a> {
    Ping,
    ReadAll,
    GetRelays,
    SetRelay { relay: &'a str, state: bool },
}

/// One `read_all` response. Sensor fields are null on the wire when the
/// board failed to read that sensor.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardSample {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(default)]
    pub soil_moisture: Option<f32>,
    #[serde(default)]
    pub relays: HashMap<String, bool>,
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    status: String,
    board: String,
}

#[derive(Debug, Deserialize)]
struct SetRelayResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct RelaysResponse {
    relays: HashMap<String, bool>,
}

pub struct BoardGateway {
    link: Mutex<Option<BufReader<BoardLink>>>,
    addr: Option<String>,
}

impl BoardGateway {
    /// Gateway that reconnects to `addr` on demand.
    pub fn new(addr: String) -> Self {
        Self {
            link: Mutex::new(None),
            addr: Some(addr),
        }
    }

    /// Gateway over an already-open stream; no reconnects.
    pub fn from_link(link: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) -> Self {
        Self {
            link: Mutex::new(Some(BufReader::new(Box::new(link) as BoardLink))),
            addr: None,
        }
    }

    pub async fn ping(&self) -> Result<String, GatewayError> {
        let response: PingResponse = self.call(Request::Ping).await?;
        if response.status != "ok" {
            return Err(GatewayError::Rejected(response.status));
        }
        Ok(response.board)
    }

    pub async fn read_all(&self) -> Result<BoardSample, GatewayError> {
        self.call(Request::ReadAll).await
    }

    pub async fn actuator_states(&self) -> Result<HashMap<String, bool>, GatewayError> {
        let response: RelaysResponse = self.call(Request::GetRelays).await?;
        Ok(response.relays)
    }

    pub async fn set_actuator(&self, actuator: Actuator, on: bool) -> Result<(), GatewayError> {
        let response: SetRelayResponse = self
            .call(Request::SetRelay {
                relay: actuator.as_str(),
                state: on,
            })
            .await?;
        if !response.success {
            return Err(GatewayError::Rejected(actuator.as_str().to_string()));
        }
        Ok(())
    }

    /// Write the full climate trio. Stops at the first failure so the caller
    /// can refrain from committing its timers.
    pub async fn set_climate(&self, states: ClimateStates) -> Result<(), GatewayError> {
        for actuator in Actuator::CLIMATE {
            self.set_actuator(actuator, states.get(actuator)).await?;
        }
        Ok(())
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        request: Request<'_>,
    ) -> Result<T, GatewayError> {
        let mut guard = self.link.lock().await;

        if guard.is_none() {
            let Some(addr) = self.addr.as_deref() else {
                return Err(GatewayError::NotConnected);
            };
            let stream = timeout(CALL_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| GatewayError::Timeout)??;
            *guard = Some(BufReader::new(Box::new(stream) as BoardLink));
        }

        let link = guard.as_mut().ok_or(GatewayError::NotConnected)?;

        let mut payload =
            serde_json::to_vec(&request).map_err(|err| GatewayError::Malformed(err.to_string()))?;
        payload.push(b'\n');

        let round_trip = timeout(CALL_TIMEOUT, async {
            link.write_all(&payload).await?;
            link.flush().await?;

            let mut line = String::new();
            if link.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "board closed the link",
                ));
            }
            Ok(line)
        })
        .await;

        let line = match round_trip {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => {
                *guard = None;
                return Err(err.into());
            }
            Err(_) => {
                *guard = None;
                return Err(GatewayError::Timeout);
            }
        };

        serde_json::from_str(&line).map_err(|err| GatewayError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    /// Serve canned responses from the board side of a duplex pipe.
    fn fake_board(
        peer: DuplexStream,
        mut respond: impl FnMut(Value) -> Option<Value> + Send + 'static,
    ) {
        tokio::spawn(async move {
            let mut peer = BufReader::new(peer);
            let mut line = String::new();
            loop {
                line.clear();
                match peer.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let request: Value = serde_json::from_str(&line).unwrap();
                let Some(response) = respond(request) else {
                    // Go silent; the client should hit its deadline.
                    continue;
                };
                let mut body = serde_json::to_vec(&response).unwrap();
                body.push(b'\n');
                if peer.get_mut().write_all(&body).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let (client, server) = duplex(4096);
        fake_board(server, |request| {
            assert_eq!(request["command"], "ping");
            Some(json!({"status": "ok", "board": "rp2040_board1"}))
        });

        let gateway = BoardGateway::from_link(client);
        assert_eq!(gateway.ping().await.unwrap(), "rp2040_board1");
    }

    #[tokio::test]
    async fn read_all_tolerates_null_sensors() {
        let (client, server) = duplex(4096);
        fake_board(server, |_| {
            Some(json!({
                "temperature": null,
                "humidity": 61.5,
                "soil_moisture": 0.42,
                "relays": {"heater": false, "light": true},
                "status": "ok"
            }))
        });

        let gateway = BoardGateway::from_link(client);
        let sample = gateway.read_all().await.unwrap();
        assert_eq!(sample.temperature, None);
        assert_eq!(sample.humidity, Some(61.5));
        assert_eq!(sample.relays.get("light"), Some(&true));
    }

    #[tokio::test]
    async fn set_actuator_sends_relay_command() {
        let (client, server) = duplex(4096);
        fake_board(server, |request| {
            assert_eq!(request["command"], "set_relay");
            assert_eq!(request["relay"], "heater");
            assert_eq!(request["state"], true);
            Some(json!({
                "command": "set_relay",
                "relay": "heater",
                "state": true,
                "success": true
            }))
        });

        let gateway = BoardGateway::from_link(client);
        gateway.set_actuator(Actuator::Heater, true).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_relay_command_is_an_error() {
        let (client, server) = duplex(4096);
        fake_board(server, |_| {
            Some(json!({"command": "set_relay", "relay": "heater", "state": true, "success": false}))
        });

        let gateway = BoardGateway::from_link(client);
        let err = gateway.set_actuator(Actuator::Heater, true).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_board_hits_the_deadline() {
        let (client, server) = duplex(4096);
        fake_board(server, |_| None);

        let gateway = BoardGateway::from_link(client);
        let err = gateway.ping().await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout));
    }

    #[tokio::test]
    async fn unconfigured_gateway_reports_not_connected() {
        let gateway = BoardGateway {
            link: Mutex::new(None),
            addr: None,
        };
        let err = gateway.ping().await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }
}
