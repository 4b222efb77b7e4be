//! JSON-lines RPC server implementation

use std::net::SocketAddr;

use futures::prelude::*;
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpStream, select};
use tokio_util::codec::Framed;

use crate::controller::{ControllerError, ControllerHandle};

/// Schema definitions as Serde serializable structures
mod message;
use message::{Event, Message, Request, Response, SetScript};

/// JSON protocol codec definition
mod codec;
use codec::*;

#[derive(Debug, Error)]
pub enum JsonServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] JsonCodecError),
}

#[derive(Debug, Error)]
enum RequestError {
    #[error("Bad request")]
    BadRequest,
    #[error("Bad request: {0}")]
    InvalidData(#[source] serde_json::Error),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

async fn dispatch(request: Request, controller: &ControllerHandle) -> Result<Value, RequestError> {
    if request.kind != "rq" {
        return Err(RequestError::BadRequest);
    }

    match request.method.as_str() {
        "stop" => {
            controller.stop().await?;
            Ok(Value::Null)
        }
        "getState" => {
            serde_json::to_value(controller.state().await?).map_err(RequestError::Encode)
        }
        "getCurrentScript" => Ok(Value::String(
            controller.current_script().await?.unwrap_or_default(),
        )),
        "getScripts" => Ok(Value::from(controller.available_scripts().await?)),
        "setScript" => {
            let SetScript { name, parameters } =
                serde_json::from_value(request.data).map_err(RequestError::InvalidData)?;

            controller.set_script(name, parameters).await?;
            Ok(Value::Null)
        }
        other => Err(RequestError::UnknownMethod(other.to_owned())),
    }
}

async fn handle_request(request: Request, controller: &ControllerHandle) -> Response {
    let id = request.id;

    match dispatch(request, controller).await {
        Ok(result) => Response::success(id, result),
        Err(error) => {
            debug!(id = %id, error = %error, "request failed");
            Response::error(id, error)
        }
    }
}

pub async fn handle_client(
    (socket, peer_addr): (TcpStream, SocketAddr),
    controller: ControllerHandle,
) -> Result<(), JsonServerError> {
    debug!(peer = %peer_addr, "accepted new connection");

    let framed = Framed::new(socket, JsonCodec::new());
    let (mut writer, mut reader) = framed.split();

    // The current state is sent right away
    let mut states = controller.subscribe();

    loop {
        select! {
            request = reader.next() => {
                match request {
                    Some(Ok(Ok(request))) => {
                        trace!(peer = %peer_addr, request = ?request, "processing request");

                        let response = handle_request(request, &controller).await;
                        writer.send(Message::Response(response)).await?;
                    }
                    Some(Ok(Err(error))) => {
                        warn!(peer = %peer_addr, error = %error, "invalid request");
                    }
                    Some(Err(error)) => {
                        return Err(error.into());
                    }
                    None => {
                        break;
                    }
                }
            },
            Some(state) = states.next() => {
                writer.send(Message::Event(Event::state_changed(state))).await?;
            },
        }
    }

    Ok(())
}
