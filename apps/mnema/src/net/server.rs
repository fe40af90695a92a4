//! # Wire Protocol Server Loop
//!
//! Accepts TCP connections and pumps framed commands onto the shared
//! memory. Each read (header or body) runs under a fixed deadline; a
//! timeout or socket error closes that connection. Command failures write
//! a fail response and keep the connection open. A `SHUTDOWN` command stops
//! the whole server.

use super::proto::{
    CMD_CHECK_ELEMENT, CMD_CREATE_ARC, CMD_CREATE_LINK, CMD_CREATE_NODE, CMD_ERASE_ELEMENT,
    CMD_FIND_ELEMENT_BY_SYSIDTF, CMD_FIND_LINKS, CMD_GET_ELEMENT_TYPE, CMD_GET_LINK_CONTENT,
    CMD_SET_LINK_CONTENT, CMD_SET_SYSIDTF, CMD_SHUTDOWN, ParamReader, ProtoError, RESULT_FAIL,
    RESULT_OK, RequestHeader, ResponseHeader, push_addr,
};
use mnema_core::{Memory, MnemaError, TypeMask};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Deadline for each header or body read.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve the wire protocol on an already-bound listener until a client
/// sends `SHUTDOWN`.
pub async fn run_server(listener: TcpListener, memory: Arc<Memory>) -> Result<(), MnemaError> {
    let local = listener
        .local_addr()
        .map_err(|e| MnemaError::IoError(format!("listener address: {e}")))?;
    tracing::info!(%local, "wire protocol server listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "client connected");
                        tokio::spawn(handle_connection(
                            stream,
                            Arc::clone(&memory),
                            shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    tracing::info!("wire protocol server stopped");
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    memory: Arc<Memory>,
    shutdown: watch::Sender<bool>,
) {
    loop {
        let header = match read_frame(
            &mut stream,
            RequestHeader::SIZE,
            ProtoError::CmdHeaderReadTimeout,
        )
        .await
        {
            Ok(bytes) => {
                let mut fixed = [0u8; RequestHeader::SIZE];
                fixed.copy_from_slice(&bytes);
                RequestHeader::decode(&fixed)
            }
            Err(e) => {
                tracing::debug!(error = %e, "closing connection");
                return;
            }
        };

        let params = match read_frame(
            &mut stream,
            header.param_size as usize,
            ProtoError::CmdParamReadTimeout,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "closing connection");
                return;
            }
        };

        tracing::debug!(cmd = header.cmd, id = header.id, params = params.len(), "command");

        let dispatch_memory = Arc::clone(&memory);
        let cmd = header.cmd;
        // Commands may block (erase waits for its erase events), so they
        // run off the async workers.
        let outcome =
            tokio::task::spawn_blocking(move || dispatch(&dispatch_memory, cmd, &params)).await;
        let (result, body, stop) = match outcome {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "command task failed");
                (RESULT_FAIL, Vec::new(), false)
            }
        };

        let response = ResponseHeader {
            cmd: header.cmd,
            id: header.id,
            result,
            result_size: body.len() as u32,
        };
        if let Err(e) = write_response(&mut stream, &response, &body).await {
            tracing::debug!(error = %e, "closing connection");
            return;
        }
        if stop {
            tracing::info!("shutdown command received");
            let _ = shutdown.send(true);
            return;
        }
    }
}

async fn read_frame(
    stream: &mut TcpStream,
    len: usize,
    timeout_error: ProtoError,
) -> Result<Vec<u8>, ProtoError> {
    let mut buffer = vec![0u8; len];
    if len == 0 {
        return Ok(buffer);
    }
    match tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut buffer)).await {
        Ok(Ok(_)) => Ok(buffer),
        Ok(Err(e)) => Err(ProtoError::Io(e.to_string())),
        Err(_) => Err(timeout_error),
    }
}

async fn write_response(
    stream: &mut TcpStream,
    header: &ResponseHeader,
    body: &[u8],
) -> Result<(), ProtoError> {
    stream
        .write_all(&header.encode())
        .await
        .map_err(|e| ProtoError::Io(e.to_string()))?;
    stream
        .write_all(body)
        .await
        .map_err(|e| ProtoError::Io(e.to_string()))?;
    stream.flush().await.map_err(|e| ProtoError::Io(e.to_string()))
}

// =============================================================================
// COMMAND DISPATCH
// =============================================================================

/// Execute one command against a fresh context. Returns the result code,
/// the response body, and whether the server should stop.
fn dispatch(memory: &Arc<Memory>, cmd: u8, params: &[u8]) -> (u8, Vec<u8>, bool) {
    if cmd == CMD_SHUTDOWN {
        return (RESULT_OK, Vec::new(), true);
    }
    let ctx = memory.context();
    let mut reader = ParamReader::new(params);

    let body: Option<Vec<u8>> = match cmd {
        CMD_CHECK_ELEMENT => reader
            .read_addr()
            .filter(|addr| ctx.is_element(*addr))
            .map(|_| Vec::new()),

        CMD_GET_ELEMENT_TYPE => reader
            .read_addr()
            .and_then(|addr| ctx.get_element_type(addr).ok())
            .map(|mask| mask.bits().to_le_bytes().to_vec()),

        CMD_ERASE_ELEMENT => reader
            .read_addr()
            .and_then(|addr| ctx.erase_element(addr).ok())
            .map(|()| Vec::new()),

        CMD_CREATE_NODE => reader
            .read_u16()
            .and_then(|bits| ctx.create_node(TypeMask::from_bits(bits)).ok())
            .map(|addr| {
                let mut out = Vec::with_capacity(4);
                push_addr(&mut out, addr);
                out
            }),

        CMD_CREATE_LINK => ctx.create_link(TypeMask::LINK_CONST).ok().map(|addr| {
            let mut out = Vec::with_capacity(4);
            push_addr(&mut out, addr);
            out
        }),

        CMD_CREATE_ARC => (|| {
            let bits = reader.read_u16()?;
            let source = reader.read_addr()?;
            let target = reader.read_addr()?;
            let addr = ctx
                .create_connector(TypeMask::from_bits(bits), source, target)
                .ok()?;
            let mut out = Vec::with_capacity(4);
            push_addr(&mut out, addr);
            Some(out)
        })(),

        CMD_GET_LINK_CONTENT => reader
            .read_addr()
            .and_then(|addr| ctx.get_link_content(addr).ok()),

        CMD_SET_LINK_CONTENT => (|| {
            let addr = reader.read_addr()?;
            let bytes = reader.read_bytes()?;
            ctx.set_link_content(addr, bytes).ok()?;
            Some(Vec::new())
        })(),

        CMD_FIND_LINKS => reader
            .read_bytes()
            .and_then(|bytes| ctx.find_links_by_content(bytes).ok())
            .map(|links| {
                let mut out = Vec::with_capacity(4 + links.len() * 4);
                out.extend_from_slice(&(links.len() as u32).to_le_bytes());
                for link in links {
                    push_addr(&mut out, link);
                }
                out
            }),

        CMD_FIND_ELEMENT_BY_SYSIDTF => (|| {
            let text = std::str::from_utf8(reader.read_bytes()?).ok()?;
            let addr = ctx.resolve_system_identifier(text).ok()?;
            let mut out = Vec::with_capacity(4);
            push_addr(&mut out, addr);
            Some(out)
        })(),

        CMD_SET_SYSIDTF => (|| {
            let addr = reader.read_addr()?;
            let text = std::str::from_utf8(reader.read_bytes()?).ok()?;
            ctx.set_system_identifier(addr, text).ok()?;
            Some(Vec::new())
        })(),

        unknown => {
            tracing::warn!(cmd = unknown, "unknown command code");
            None
        }
    };

    match body {
        Some(body) => (RESULT_OK, body, false),
        None => (RESULT_FAIL, Vec::new(), false),
    }
}
