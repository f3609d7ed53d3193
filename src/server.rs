use crate::config::Config;

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use codec::{Payload, Request, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use service::{NodeId, Outbound, Realm, Service, SessionId};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::timeout,
};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tungstenite::Message;

/// How long the establishment handshake may take before the connection is
/// dropped.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// The outbound half of a live websocket session: frames queue to the
/// connection's pump task, which owns the socket.
struct Sender(UnboundedSender<String>);

impl Outbound for Sender {
    fn send(&self, frame: String) -> Result<(), service::Error> {
        self.0.send(frame).map_err(|_| service::Error::Send)
    }
}

/// Bind the listener and establish the upstream session, as configured.
pub async fn start(config: &Arc<Config>, service: &Arc<Service>) -> Result<()> {
    if let Some(listen) = config.ws.listen {
        let listener = TcpListener::bind(listen).await?;
        log::info!("websocket listener bound: addr={}", listen);

        let service = service.clone();
        tokio::spawn(async move {
            while let Ok((stream, source)) = listener.accept().await {
                log::info!("connection accepted: addr={}", source);

                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept(stream, service).await {
                        log::warn!("connection failed: addr={} error={}", source, e);
                    }
                });
            }
        });
    }

    if let Some(upstream) = &config.node.upstream {
        connect(upstream, config, service.clone()).await?;
    }

    Ok(())
}

/// Downstream side of session establishment.
///
/// The connecting node opens with a `blade.connect` request carrying its
/// node id; the reply assigns the session id and propagates this side's
/// master identity and realms.  Identity propagation here is what lets
/// the child address `blade.publish`/`blade.locate` at the Master later.
async fn accept(stream: TcpStream, service: Arc<Service>) -> Result<()> {
    let mut socket = accept_async(stream).await?;

    let hello = read_request(&mut socket).await?;
    if hello.method != "blade.connect" {
        bail!("expected blade.connect, got {}", hello.method);
    }
    let nodeid = hello
        .param_str("nodeid")
        .ok_or_else(|| anyhow!("blade.connect missing nodeid"))?
        .to_string();

    let (tx, rx) = unbounded_channel();
    let session_id = service.session_attach(Box::new(Sender(tx)));

    let mut result = json!({
        "sessionid": session_id.as_str(),
        "realms": service
            .realms()
            .iter()
            .map(|realm| realm.as_str().to_string())
            .collect::<Vec<_>>(),
    });
    if let Some(master) = service.master_id() {
        result["master-nodeid"] = json!(master.as_str());
    }

    let reply = Response::result(hello.id, result);
    socket
        .send(Message::Text(codec::encode(&reply).map_err(|e| anyhow!(e))?))
        .await?;

    service.downstream_established(&session_id, NodeId::from(nodeid.as_str()));
    log::info!("downstream session established: id={} nodeid={}", session_id, nodeid);

    pump(socket, rx, session_id, service).await;

    Ok(())
}

/// Upstream side of session establishment.
async fn connect(url: &str, config: &Arc<Config>, service: Arc<Service>) -> Result<()> {
    service
        .upstream_connecting()
        .map_err(|e| anyhow!("upstream connect refused: {}", e))?;

    let established = async {
        let (mut socket, _) = connect_async(url).await?;

        let hello = Request::new(
            "connect".to_string(),
            "blade.connect",
            Some(json!({
                "nodeid": config.local_nodeid(),
                "agent": crate::SOFTWARE,
            })),
        );
        socket
            .send(Message::Text(codec::encode(&hello).map_err(|e| anyhow!(e))?))
            .await?;

        let reply = read_response(&mut socket).await?;
        if let Some(error) = reply.error {
            bail!("upstream refused establishment: {}", error.message);
        }

        let master = reply
            .result_value("master-nodeid")
            .and_then(|value| value.as_str())
            .map(NodeId::from)
            .ok_or_else(|| anyhow!("upstream did not announce a master"))?;
        let realms = reply
            .result_value("realms")
            .and_then(|value| value.as_array())
            .map(|realms| {
                realms
                    .iter()
                    .filter_map(|realm| realm.as_str())
                    .map(Realm::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok((socket, master, realms))
    };

    let (socket, master, realms) = match established.await {
        Ok(established) => established,
        Err(e) => {
            service.upstream_failed();
            return Err(e);
        }
    };

    let (tx, rx) = unbounded_channel();
    let session_id = service.session_attach(Box::new(Sender(tx)));
    service.upstream_established(&session_id, master, realms);

    tokio::spawn(pump(socket, rx, session_id, service));

    Ok(())
}

/// Drive one established session until either side goes away.
///
/// Outbound frames queued by the service are written to the socket,
/// inbound text frames are processed in arrival order, and the session is
/// reaped when the connection ends.
async fn pump<S>(
    mut socket: WebSocketStream<S>,
    mut rx: UnboundedReceiver<String>,
    session_id: SessionId,
    service: Arc<Service>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // the session was detached under us
                None => break,
            },
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => service.process(&session_id, &text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        }
    }

    let _ = socket.close(None).await;
    service.session_closed(&session_id);
}

async fn read_request<S>(socket: &mut WebSocketStream<S>) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match codec::decode(&read_text(socket).await?).map_err(|e| anyhow!(e))? {
        Payload::Request(request) => Ok(request),
        Payload::Response(_) => bail!("expected a request during establishment"),
    }
}

async fn read_response<S>(socket: &mut WebSocketStream<S>) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match codec::decode(&read_text(socket).await?).map_err(|e| anyhow!(e))? {
        Payload::Response(response) => Ok(response),
        Payload::Request(_) => bail!("expected a response during establishment"),
    }
}

async fn read_text<S>(socket: &mut WebSocketStream<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(ESTABLISH_TIMEOUT, async {
        while let Some(message) = socket.next().await {
            match message? {
                Message::Text(text) => return Ok(text),
                Message::Close(_) => bail!("connection closed during establishment"),
                _ => continue,
            }
        }

        bail!("connection ended during establishment")
    })
    .await
    .map_err(|_| anyhow!("establishment timed out"))?
}
