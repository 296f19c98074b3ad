use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use slog::Logger;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_serde::formats::SymmetricalJson;
use tokio_serde::SymmetricallyFramed;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use huck_core::error::Result;

use crate::raft::MemberId;
use crate::rpc::{Address, Command, Message};

const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Accept peer connections and stream their messages into the server
/// loop.
pub async fn listen_task(
    logger: Logger,
    listener: TcpListener,
    rpc_tx: mpsc::UnboundedSender<Message>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(logger, "accept failed"; "error" => err.to_string());
                        continue;
                    }
                };
                debug!(logger, "peer connected"; "addr" => addr.to_string());
                let peer_tx = rpc_tx.clone();
                let peer_logger = logger.new(o!("peer" => addr.to_string()));
                tokio::spawn(async move {
                    if let Err(err) = stream_messages(stream, peer_tx).await {
                        debug!(peer_logger, "peer disconnected"; "error" => err.to_string());
                    }
                });
            }
        }
    }
    Ok(())
}

async fn stream_messages(
    stream: TcpStream,
    rpc_tx: mpsc::UnboundedSender<Message>,
) -> Result<()> {
    let (r, _w) = stream.into_split();
    let framed = FramedRead::new(r, LengthDelimitedCodec::new());
    let mut messages =
        SymmetricallyFramed::new(framed, SymmetricalJson::<Message>::default());
    while let Some(message) = messages.next().await {
        rpc_tx.send(message?)?;
    }
    Ok(())
}

/// Maintain an outbound connection to one peer, reconnecting as needed.
/// Undeliverable messages are dropped (the protocol tolerates loss) and
/// reported so the leader's failure accounting sees them.
pub async fn peer_task(
    logger: Logger,
    member: MemberId,
    addr: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Message>,
    rpc_tx: mpsc::UnboundedSender<Message>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    let mut sink: Option<
        SymmetricallyFramed<
            FramedWrite<tokio::net::tcp::OwnedWriteHalf, LengthDelimitedCodec>,
            Message,
            SymmetricalJson<Message>,
        >,
    > = None;

    loop {
        let message = tokio::select! {
            _ = shutdown.recv() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if sink.is_none() {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let (_r, w) = stream.into_split();
                    let framed = FramedWrite::new(w, LengthDelimitedCodec::new());
                    sink = Some(SymmetricallyFramed::new(
                        framed,
                        SymmetricalJson::<Message>::default(),
                    ));
                    debug!(logger, "connected"; "addr" => addr.to_string());
                }
                Err(err) => {
                    debug!(logger, "could not connect"; "addr" => addr.to_string(), "error" => err.to_string());
                    rpc_tx.send(Message::new(
                        Address::Local,
                        Address::Peer(member),
                        Command::Unreachable { member },
                    ))?;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
        }

        if let Some(out) = sink.as_mut() {
            if let Err(err) = out.send(message).await {
                debug!(logger, "write failed"; "addr" => addr.to_string(), "error" => err.to_string());
                sink = None;
                rpc_tx.send(Message::new(
                    Address::Local,
                    Address::Peer(member),
                    Command::Unreachable { member },
                ))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn messages_round_trip_between_tasks() {
        let logger = huck_core::logger::get_root_logger().new(o!());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        tokio::spawn(listen_task(
            logger.new(o!()),
            listener,
            in_tx,
            shutdown_tx.subscribe(),
        ));

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (unreachable_tx, _unreachable_rx) = mpsc::unbounded_channel();
        tokio::spawn(peer_task(
            logger.new(o!()),
            2,
            addr,
            out_rx,
            unreachable_tx,
            shutdown_tx.subscribe(),
        ));

        let sent = Message::new(
            Address::Peer(2),
            Address::Peer(1),
            Command::Vote {
                term: 4,
                candidate: 1,
                last_index: 9,
                last_term: 3,
            },
        );
        out_tx.send(sent).unwrap();

        let received = in_rx.recv().await.unwrap();
        assert_eq!(received.to, Address::Peer(2));
        match received.command {
            Command::Vote { term, .. } => assert_eq!(term, 4),
            other => panic!("unexpected command {:?}", other),
        }

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn unreachable_peers_are_reported() {
        let logger = huck_core::logger::get_root_logger().new(o!());
        // nothing is listening here
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (unreachable_tx, mut unreachable_rx) = mpsc::unbounded_channel();
        tokio::spawn(peer_task(
            logger,
            7,
            addr,
            out_rx,
            unreachable_tx,
            shutdown_tx.subscribe(),
        ));

        out_tx
            .send(Message::new(Address::Peer(7), Address::Peer(1), Command::Tick))
            .unwrap();

        let report = unreachable_rx.recv().await.unwrap();
        match report.command {
            Command::Unreachable { member } => assert_eq!(member, 7),
            other => panic!("unexpected command {:?}", other),
        }
        let _ = shutdown_tx.send(());
    }
}
